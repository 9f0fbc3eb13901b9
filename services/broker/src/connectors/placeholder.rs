//! A connector that satisfies the contract without talking to any
//! upstream: emits one `status` event explaining why, then idles until
//! cancelled. Used for upstreams whose real protocol (e.g. WhatsApp
//! multi-device's Signal-protocol pairing) is infeasible at this depth.

use async_trait::async_trait;
use cb_connector::{Connector, ConnectorError, PublishFn, SendRequest};
use cb_protocol::Event;
use tokio_util::sync::CancellationToken;

pub struct PlaceholderConnector {
    kind: &'static str,
    reason: &'static str,
    publish: PublishFn,
}

impl PlaceholderConnector {
    pub fn new(kind: &'static str, reason: &'static str, publish: PublishFn) -> Self {
        PlaceholderConnector { kind, reason, publish }
    }
}

#[async_trait]
impl Connector for PlaceholderConnector {
    async fn run(&self, cancel: CancellationToken) {
        let mut e = Event::new("", "", "status");
        e.direction = "system".to_string();
        e.text = format!("{} connector not implemented: {}", self.kind, self.reason);
        (self.publish)(e);
        cancel.cancelled().await;
    }

    async fn send(&self, _req: SendRequest) -> Result<Event, ConnectorError> {
        Err(ConnectorError::Unsupported(format!("{}: {}", self.kind, self.reason)))
    }

    fn identity(&self) -> String {
        String::new()
    }
}
