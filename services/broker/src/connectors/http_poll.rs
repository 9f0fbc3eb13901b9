//! A long-poll connector covering REST-polled upstreams (`telegram`,
//! `twilio`, `zulip`, `matrix` in the constructor table). Polls an
//! `endpoint?since=<cursor>` URL every `poll_interval`, expecting a JSON
//! array of the same shared envelope shape `ws_socket` uses.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use cb_connector::{Allowlist, Backoff, Connector, ConnectorError, PublishFn, SendRequest};
use cb_protocol::Event;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    cursor: i64,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    thread: String,
    #[serde(default)]
    text: String,
}

pub struct HttpPollConnector {
    endpoint: String,
    token: String,
    allowlist: Allowlist,
    publish: PublishFn,
    identity: RwLock<String>,
    cursor: AtomicI64,
    client: Client,
    poll_interval: Duration,
}

impl HttpPollConnector {
    pub fn new(
        endpoint: String,
        token: String,
        identity: String,
        allowlist_channels: Vec<String>,
        publish: PublishFn,
    ) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("building the shared reqwest client with static options cannot fail");
        HttpPollConnector {
            endpoint,
            token,
            allowlist: Allowlist::new(allowlist_channels),
            publish,
            identity: RwLock::new(identity),
            cursor: AtomicI64::new(0),
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    async fn poll_once(&self) -> Result<(), ConnectorError> {
        let cursor = self.cursor.load(Ordering::Relaxed);
        let mut req = self.client.get(&self.endpoint).query(&[("since", cursor.to_string())]);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await.map_err(|e| ConnectorError::Send(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ConnectorError::Send(format!("upstream status {}", resp.status())));
        }
        let envelopes: Vec<InboundEnvelope> =
            resp.json().await.map_err(|e| ConnectorError::Send(e.to_string()))?;

        let identity = self.identity.read().unwrap().clone();
        for env in envelopes {
            self.cursor.fetch_max(env.cursor, Ordering::Relaxed);
            if env.user == identity && !identity.is_empty() {
                continue;
            }
            if !self.allowlist.allows(&env.channel) {
                continue;
            }
            let mut e = Event::new("", "", if env.kind.is_empty() { "message".to_string() } else { env.kind });
            e.direction = "in".to_string();
            e.user = env.user;
            e.channel = env.channel;
            e.thread = env.thread;
            e.text = env.text;
            (self.publish)(e);
        }
        Ok(())
    }
}

fn status_event(text: &str) -> Event {
    let mut e = Event::new("", "", "status");
    e.direction = "system".to_string();
    e.text = text.to_string();
    e
}

#[async_trait]
impl Connector for HttpPollConnector {
    async fn run(&self, cancel: CancellationToken) {
        (self.publish)(status_event("connector online"));
        info!(endpoint = %self.endpoint, "http-poll connector online");
        let mut backoff = Backoff::default();
        let mut heartbeat = tokio::time::interval(Duration::from_secs(45));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return;
                }
                _ = heartbeat.tick() => {
                    (self.publish)(Event::new("", "", "heartbeat"));
                }
                result = self.poll_once() => {
                    match result {
                        Ok(()) => {
                            backoff.reset();
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(self.poll_interval) => {}
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "poll failed, backing off");
                            (self.publish)(status_event(&format!("reconnecting after error: {e}")));
                            let delay = backoff.next();
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn send(&self, req: SendRequest) -> Result<Event, ConnectorError> {
        let mut http_req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "channel": req.channel,
            "thread": req.thread,
            "text": req.text,
        }));
        if !self.token.is_empty() {
            http_req = http_req.bearer_auth(&self.token);
        }
        let resp = http_req.send().await.map_err(|e| ConnectorError::Send(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ConnectorError::Send(format!("upstream status {}", resp.status())));
        }
        self.allowlist.admit(&req.channel);
        debug!(channel = %req.channel, "sent via http-poll connector");

        let mut e = Event::new("", "", "message");
        e.direction = "out".to_string();
        e.user = self.identity.read().unwrap().clone();
        e.target = req.target;
        e.channel = req.channel;
        e.thread = req.thread;
        e.text = req.text;
        Ok(e)
    }

    fn identity(&self) -> String {
        self.identity.read().unwrap().clone()
    }
}
