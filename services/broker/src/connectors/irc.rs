//! A minimal raw-TCP IRC connector: connects, registers with `NICK`/`USER`,
//! and translates `PRIVMSG` lines to/from events. No SASL, no TLS, no
//! CTCP — enough surface to satisfy the `Connector` contract, not a full
//! client.

use std::time::Duration;

use async_trait::async_trait;
use cb_connector::{Allowlist, Backoff, Connector, ConnectorError, PublishFn, SendRequest};
use cb_protocol::Event;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct IrcConnector {
    addr: String,
    nick: String,
    allowlist: Allowlist,
    publish: PublishFn,
    writer: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
}

impl IrcConnector {
    pub fn new(addr: String, nick: String, allowlist_channels: Vec<String>, publish: PublishFn) -> Self {
        IrcConnector {
            addr,
            nick,
            allowlist: Allowlist::new(allowlist_channels),
            publish,
            writer: Mutex::new(None),
        }
    }

    async fn connect_once(&self) -> Result<(), ConnectorError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ConnectorError::Send(format!("connect {}: {e}", self.addr)))?;
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(format!("NICK {}\r\nUSER {} 0 * :{}\r\n", self.nick, self.nick, self.nick).as_bytes())
            .await
            .map_err(|e| ConnectorError::Send(e.to_string()))?;
        *self.writer.lock().await = Some(write_half);

        (self.publish)(status_event("connector online"));
        info!(addr = %self.addr, "irc connector online");

        let mut lines = BufReader::new(read_half).lines();
        let mut heartbeat = tokio::time::interval(Duration::from_secs(45));
        heartbeat.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    (self.publish)(Event::new("", "", "heartbeat"));
                }
                line = lines.next_line() => match line {
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(ConnectorError::Send(e.to_string())),
                    Ok(Some(line)) => self.handle_line(&line).await,
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        if let Some(rest) = line.strip_prefix("PING ") {
            if let Some(writer) = self.writer.lock().await.as_mut() {
                let _ = writer.write_all(format!("PONG {rest}\r\n").as_bytes()).await;
            }
            return;
        }
        // :nick!user@host PRIVMSG #channel :message text
        let Some((prefix, rest)) = line.split_once(' ') else { return };
        if !prefix.starts_with(':') {
            return;
        }
        let Some(rest) = rest.strip_prefix("PRIVMSG ") else { return };
        let Some((channel, text)) = rest.split_once(" :") else { return };
        if !self.allowlist.allows(channel) {
            return;
        }
        let sender = prefix.trim_start_matches(':').split(['!', '@']).next().unwrap_or("").to_string();
        if sender == self.nick {
            return;
        }
        let mut e = Event::new("", "", "message");
        e.direction = "in".to_string();
        e.user = sender;
        e.channel = channel.to_string();
        e.text = text.to_string();
        (self.publish)(e);
    }
}

fn status_event(text: &str) -> Event {
    let mut e = Event::new("", "", "status");
    e.direction = "system".to_string();
    e.text = text.to_string();
    e
}

#[async_trait]
impl Connector for IrcConnector {
    async fn run(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::default();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                r = self.connect_once() => r,
            };
            *self.writer.lock().await = None;
            match result {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    warn!(error = %e, "irc connector error, backing off");
                    (self.publish)(status_event(&format!("reconnecting after error: {e}")));
                }
            }
            let delay = backoff.next();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn send(&self, req: SendRequest) -> Result<Event, ConnectorError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectorError::NotConnected)?;
        writer
            .write_all(format!("PRIVMSG {} :{}\r\n", req.channel, req.text).as_bytes())
            .await
            .map_err(|e| ConnectorError::Send(e.to_string()))?;
        drop(guard);
        self.allowlist.admit(&req.channel);

        let mut e = Event::new("", "", "message");
        e.direction = "out".to_string();
        e.user = self.nick.clone();
        e.target = req.target;
        e.channel = req.channel;
        e.thread = req.thread;
        e.text = req.text;
        Ok(e)
    }

    fn identity(&self) -> String {
        self.nick.clone()
    }
}
