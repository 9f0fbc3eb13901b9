//! The abstract interface every upstream connector implementation satisfies
//! (spec §4.3), plus small shared helpers (backoff, channel allowlist) that
//! every concrete connector needs and that would otherwise be duplicated
//! nine times over.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cb_protocol::Event;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("not connected")]
    NotConnected,
    #[error("not implemented: {0}")]
    Unsupported(String),
}

/// Parameters for a synchronous outbound send. At least one of
/// `target`/`channel`/`thread` is populated by the broker before the call
/// reaches the connector (see `services/broker`'s `send` handler).
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub target: String,
    pub channel: String,
    pub thread: String,
    pub text: String,
}

/// Callback a connector invokes for every event it produces — inbound
/// messages, its own outbound sends, `status`, and `heartbeat`. Classification,
/// persistence, and fan-out all happen on the far side of this closure; the
/// connector's only job is to call it.
pub type PublishFn = Arc<dyn Fn(Event) + Send + Sync>;

/// The capability set every upstream connector implementation satisfies.
///
/// Implementations are stored as `Box<dyn Connector>` behind the broker's
/// connector supervisor (see `services/broker::supervisor`). `run` must
/// never return early on transient failure — it owns its own
/// reconnect-with-backoff loop and only returns when `cancel` fires.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Drive the connector until `cancel` is triggered. Must emit a
    /// `status` event on connect/reconnect/error and a `heartbeat` event
    /// roughly every 45s while connected.
    async fn run(&self, cancel: CancellationToken);

    /// Synchronous send. Returns the resulting `message`-kind, `out`
    /// direction event (not yet classified by the publish pipeline) or an
    /// error the broker surfaces verbatim on the `send` RPC.
    async fn send(&self, req: SendRequest) -> Result<Event, ConnectorError>;

    /// This connector's own upstream user id, once authenticated. Empty
    /// until known — used for self-send filtering and `@mention` detection.
    fn identity(&self) -> String;
}

// ---------------------------------------------------------------------------
// Channel allowlist
// ---------------------------------------------------------------------------

/// A connector's channel allowlist (spec §4.3): if configured non-empty,
/// inbound events from channels outside the set are dropped at the
/// connector boundary. Sending to a channel implicitly adds it, so replies
/// on a newly-targeted channel are not immediately dropped.
#[derive(Debug, Default)]
pub struct Allowlist {
    channels: RwLock<HashSet<String>>,
    /// Whether the list started non-empty (an empty allowlist never filters).
    active: bool,
}

impl Allowlist {
    pub fn new(channels: impl IntoIterator<Item = String>) -> Self {
        let set: HashSet<String> = channels.into_iter().collect();
        let active = !set.is_empty();
        Allowlist { channels: RwLock::new(set), active }
    }

    pub fn empty() -> Self {
        Allowlist { channels: RwLock::new(HashSet::new()), active: false }
    }

    /// True if `channel` should be allowed through (either the allowlist is
    /// inactive, or `channel` is a member).
    pub fn allows(&self, channel: &str) -> bool {
        if !self.active {
            return true;
        }
        self.channels.read().unwrap().contains(channel)
    }

    /// Implicitly admit `channel` (called after a successful outbound send).
    /// A no-op when the allowlist was never activated (stays permissive).
    pub fn admit(&self, channel: &str) {
        if channel.is_empty() {
            return;
        }
        self.channels.write().unwrap().insert(channel.to_string());
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Exponential backoff starting at 1s, capped at 30s, reset on success —
/// the schedule every connector's reconnect loop uses (spec §4.3).
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    start: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(start: Duration, cap: Duration) -> Self {
        Backoff { current: start, start, cap }
    }

    /// The delay to sleep before the next reconnect attempt, doubling for
    /// next time (capped).
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Reset to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let seq: Vec<_> = (0..7).map(|_| b.next()).collect();
        assert_eq!(
            seq,
            vec![1, 2, 4, 8, 16, 30, 30].into_iter().map(Duration::from_secs).collect::<Vec<_>>()
        );
    }

    #[test]
    fn backoff_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }

    #[test]
    fn allowlist_inactive_when_empty() {
        let a = Allowlist::empty();
        assert!(a.allows("anything"));
    }

    #[test]
    fn allowlist_filters_when_configured() {
        let a = Allowlist::new(vec!["C1".to_string()]);
        assert!(a.allows("C1"));
        assert!(!a.allows("C2"));
    }

    #[test]
    fn allowlist_admits_sent_channel() {
        let a = Allowlist::new(vec!["C1".to_string()]);
        assert!(!a.allows("C2"));
        a.admit("C2");
        assert!(a.allows("C2"));
    }
}
