//! Per-bot-key subscriber registry and fan-out (spec §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use cb_protocol::Event;
use tokio::sync::mpsc;
use tracing::warn;

/// Capacity of each subscriber's buffered channel. The spec requires
/// "capacity >= 64"; a slow reader beyond that loses events (backpressure
/// policy below), not the publisher.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// A connection-scoped view filter (spec §4.2 step 3): exact match on
/// target/channel/thread when set, case-insensitive substring on text, and
/// a `notify_only` gate.
#[derive(Debug, Clone, Default)]
pub struct SubFilter {
    pub target: Option<String>,
    pub channel: Option<String>,
    pub thread: Option<String>,
    pub search: Option<String>,
    pub notify_only: bool,
}

impl SubFilter {
    pub fn matches(&self, e: &Event) -> bool {
        if let Some(t) = &self.target {
            if &e.target != t {
                return false;
            }
        }
        if let Some(c) = &self.channel {
            if &e.channel != c {
                return false;
            }
        }
        if let Some(th) = &self.thread {
            if &e.thread != th {
                return false;
            }
        }
        if let Some(s) = &self.search {
            if !e.text.to_lowercase().contains(&s.to_lowercase()) {
                return false;
            }
        }
        if self.notify_only && !e.notify {
            return false;
        }
        true
    }
}

struct Subscriber {
    id: u64,
    filter: SubFilter,
    tx: mpsc::Sender<Event>,
}

static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// `subsByBot`: one entry per bot key, each holding zero or more live
/// subscribers for that key.
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_bot: RwLock<HashMap<String, Vec<Subscriber>>>,
}

/// A handle a `subscribe` connection holds; dropping it (or calling
/// `deregister` explicitly) removes the subscriber from every bot key it
/// joined.
pub struct SubscriptionHandle {
    id: u64,
    bot_keys: Vec<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry::default()
    }

    /// Register one buffered channel per selected bot key, sharing the same
    /// filter and receiver across all of them (events from any joined bot
    /// key arrive on the same stream, merged by the caller).
    pub fn register(
        &self,
        bot_keys: &[String],
        filter: SubFilter,
    ) -> (SubscriptionHandle, mpsc::Receiver<Event>) {
        let id = NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut map = self.by_bot.write().unwrap();
        for key in bot_keys {
            map.entry(key.clone())
                .or_default()
                .push(Subscriber { id, filter: filter.clone(), tx: tx.clone() });
        }
        (SubscriptionHandle { id, bot_keys: bot_keys.to_vec() }, rx)
    }

    pub fn deregister(&self, handle: &SubscriptionHandle) {
        let mut map = self.by_bot.write().unwrap();
        for key in &handle.bot_keys {
            if let Some(subs) = map.get_mut(key) {
                subs.retain(|s| s.id != handle.id);
            }
        }
    }

    /// Fan `event` out to every subscriber registered for `bot_key` whose
    /// filter passes. A full channel drops the event for that subscriber
    /// and logs a warning rather than blocking the publisher.
    pub fn publish(&self, bot_key: &str, event: &Event) {
        let map = self.by_bot.read().unwrap();
        let Some(subs) = map.get(bot_key) else { return };
        for sub in subs {
            if !sub.filter.matches(event) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone()) {
                warn!(bot_key, subscriber_id = sub.id, "dropping event for slow subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(notify: bool) -> Event {
        let mut e = Event::new("slack", "ops-bot", "message");
        e.direction = "in".to_string();
        e.channel = "C1".to_string();
        e.text = "deploy finished".to_string();
        e.notify = notify;
        e
    }

    #[test]
    fn publish_reaches_registered_subscriber() {
        let reg = SubscriptionRegistry::new();
        let (_handle, mut rx) = reg.register(&["slack:ops-bot".to_string()], SubFilter::default());
        reg.publish("slack:ops-bot", &sample_event(false));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn notify_only_filter_drops_non_notify_events() {
        let reg = SubscriptionRegistry::new();
        let filter = SubFilter { notify_only: true, ..Default::default() };
        let (_handle, mut rx) = reg.register(&["slack:ops-bot".to_string()], filter);
        reg.publish("slack:ops-bot", &sample_event(false));
        assert!(rx.try_recv().is_err());
        reg.publish("slack:ops-bot", &sample_event(true));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn deregister_stops_further_delivery() {
        let reg = SubscriptionRegistry::new();
        let (handle, mut rx) = reg.register(&["slack:ops-bot".to_string()], SubFilter::default());
        reg.deregister(&handle);
        reg.publish("slack:ops-bot", &sample_event(false));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unrelated_bot_key_does_not_receive() {
        let reg = SubscriptionRegistry::new();
        let (_handle, mut rx) = reg.register(&["slack:ops-bot".to_string()], SubFilter::default());
        reg.publish("discord:other-bot", &sample_event(false));
        assert!(rx.try_recv().is_err());
    }
}
