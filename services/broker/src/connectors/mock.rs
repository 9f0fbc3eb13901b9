//! A fully deterministic, in-process connector used by integration tests
//! and local development. Inbound traffic is driven by calling
//! [`Mock::inject`] rather than any real upstream.

use std::time::Duration;

use async_trait::async_trait;
use cb_connector::{Allowlist, Connector, ConnectorError, PublishFn, SendRequest};
use cb_protocol::Event;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Mock {
    identity: String,
    allowlist: Allowlist,
    publish: PublishFn,
    inbound_tx: mpsc::UnboundedSender<Event>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    heartbeat: Duration,
}

impl Mock {
    pub fn new(identity: String, allowlist_channels: Vec<String>, publish: PublishFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Mock {
            identity,
            allowlist: Allowlist::new(allowlist_channels),
            publish,
            inbound_tx: tx,
            inbound_rx: Mutex::new(Some(rx)),
            heartbeat: Duration::from_secs(45),
        }
    }

    /// Override the heartbeat period (tests use a short one to avoid
    /// sleeping 45 real seconds).
    pub fn with_heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = period;
        self
    }

    /// Simulate an inbound event from upstream. Fields beyond
    /// kind/direction/user/channel/thread/text are filled by the broker's
    /// publish pipeline.
    pub fn inject(&self, event: Event) {
        let _ = self.inbound_tx.send(event);
    }
}

#[async_trait]
impl Connector for Mock {
    async fn run(&self, cancel: CancellationToken) {
        (self.publish)(Event::new("mock", "", "status").with_text("connector online"));
        let mut rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .expect("Mock::run invoked more than once");
        let mut hb = tokio::time::interval(self.heartbeat);
        hb.tick().await; // first tick fires immediately; consume it
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("mock connector stopping");
                    return;
                }
                _ = hb.tick() => {
                    (self.publish)(Event::new("mock", "", "heartbeat"));
                }
                maybe_event = rx.recv() => {
                    let Some(event) = maybe_event else { return };
                    if event.direction == "in" && event.user == self.identity && !self.identity.is_empty() {
                        continue;
                    }
                    if !self.allowlist.allows(&event.channel) {
                        continue;
                    }
                    (self.publish)(event);
                }
            }
        }
    }

    async fn send(&self, req: SendRequest) -> Result<Event, ConnectorError> {
        let mut e = Event::new("mock", "", "message");
        e.direction = "out".to_string();
        e.user = self.identity.clone();
        e.target = req.target;
        e.channel = req.channel;
        e.thread = req.thread;
        e.text = req.text;
        self.allowlist.admit(&e.channel);
        Ok(e)
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }
}

trait EventExt {
    fn with_text(self, text: &str) -> Self;
}

impl EventExt for Event {
    fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn capturing_publish() -> (PublishFn, Arc<StdMutex<Vec<Event>>>) {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let captured_clone = captured.clone();
        let f: PublishFn = Arc::new(move |e| captured_clone.lock().unwrap().push(e));
        (f, captured)
    }

    #[tokio::test]
    async fn send_returns_out_event_with_identity() {
        let (publish, _captured) = capturing_publish();
        let mock = Mock::new("U-BOT".to_string(), vec![], publish);
        let e = mock
            .send(SendRequest { target: String::new(), channel: "C1".to_string(), thread: String::new(), text: "hi".to_string() })
            .await
            .unwrap();
        assert_eq!(e.direction, "out");
        assert_eq!(e.user, "U-BOT");
        assert_eq!(e.channel, "C1");
    }

    #[tokio::test]
    async fn run_emits_status_then_forwards_injected_event() {
        let (publish, captured) = capturing_publish();
        let mock = Arc::new(Mock::new("U-BOT".to_string(), vec![], publish).with_heartbeat(Duration::from_secs(3600)));
        let cancel = CancellationToken::new();
        let mock2 = mock.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { mock2.run(cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut ev = Event::new("mock", "ops-bot", "message");
        ev.channel = "C1".to_string();
        ev.text = "hello".to_string();
        mock.inject(ev);
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        let events = captured.lock().unwrap();
        assert!(events.iter().any(|e| e.kind == "status"));
        assert!(events.iter().any(|e| e.text == "hello"));
    }

    #[tokio::test]
    async fn self_sent_inbound_is_dropped_at_boundary() {
        let (publish, captured) = capturing_publish();
        let mock = Arc::new(Mock::new("U-BOT".to_string(), vec![], publish).with_heartbeat(Duration::from_secs(3600)));
        let cancel = CancellationToken::new();
        let mock2 = mock.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { mock2.run(cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut ev = Event::new("mock", "ops-bot", "message");
        ev.direction = "in".to_string();
        ev.user = "U-BOT".to_string();
        ev.text = "echo of my own message".to_string();
        mock.inject(ev);
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        let events = captured.lock().unwrap();
        assert!(!events.iter().any(|e| e.text == "echo of my own message"));
    }
}
