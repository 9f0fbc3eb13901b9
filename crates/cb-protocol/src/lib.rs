//! Wire-compatible request/response/event records for the broker's local
//! Unix-domain control socket.
//!
//! One JSON value is read per request and one JSON value (or, for
//! `subscribe`, a stream of them) is written per response — see the broker
//! crate for the framing. Everything here is plain serde data; no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The unit of exchange between connectors, the store, and subscribers.
///
/// `kind` and `direction` are deliberately `String`, not an enum: the spec
/// enumerates `message`/`status`/`heartbeat`/`tick`/`dm` and `in`/`out`/`system`
/// by usage only, and new connectors may introduce additional kinds that the
/// store must still accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// DB-assigned after insert; 0 on ephemeral (never-persisted) events.
    #[serde(default)]
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub bot: String,
    pub kind: String,
    pub direction: String,
    #[serde(default)]
    pub user: String,
    /// Derived: `user == connector.identity()`.
    #[serde(rename = "self", default)]
    pub is_self: bool,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub thread: String,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "mentions_agent", default)]
    pub mentions: bool,
    #[serde(rename = "direct_to_agent", default)]
    pub direct: bool,
    #[serde(default)]
    pub notify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
}

impl Event {
    /// A fresh, unclassified, unpersisted event. Callers fill in the rest.
    pub fn new(service: impl Into<String>, bot: impl Into<String>, kind: impl Into<String>) -> Self {
        Event {
            id: 0,
            timestamp: Utc::now(),
            service: service.into(),
            bot: bot.into(),
            kind: kind.into(),
            direction: "in".to_string(),
            user: String::new(),
            is_self: false,
            target: String::new(),
            channel: String::new(),
            thread: String::new(),
            text: String::new(),
            mentions: false,
            direct: false,
            notify: false,
            notification_id: None,
            seen: None,
            seen_at: None,
        }
    }

    /// The participation route key for this event: `t=<target>|c=<channel>|th=<thread>`.
    pub fn route_key(&self) -> String {
        route_key(&self.target, &self.channel, &self.thread)
    }

    /// `service:name` — the broker's primary routing identifier.
    pub fn bot_key(&self) -> String {
        bot_key(&self.service, &self.bot)
    }
}

/// Build a route key from raw parts. Empty when all three parts are empty,
/// per the spec's identity-filter invariant (`routeKey(∅)` is empty).
pub fn route_key(target: &str, channel: &str, thread: &str) -> String {
    if target.is_empty() && channel.is_empty() && thread.is_empty() {
        return String::new();
    }
    format!("t={target}|c={channel}|th={thread}")
}

/// Build a bot key from its parts.
pub fn bot_key(service: &str, bot: &str) -> String {
    format!("{service}:{bot}")
}

// ---------------------------------------------------------------------------
// BotRef
// ---------------------------------------------------------------------------

/// A configured bot's identity, as returned by the `bots` RPC action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotRef {
    pub service: String,
    pub name: String,
    /// Populated at runtime from the connector's `identity()`; empty until known.
    #[serde(default)]
    pub bot_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// A persisted, ack-trackable pointer to an event the broker judged
/// agent-relevant. Denormalised so notification queries never join events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub id: i64,
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub bot: String,
    pub target: String,
    pub channel: String,
    pub thread: String,
    pub text: String,
    #[serde(rename = "mentions_agent")]
    pub mentions: bool,
    #[serde(rename = "direct_to_agent")]
    pub direct: bool,
    pub notify: bool,
    pub seen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Filters shared by history/notifications/clear/mark queries
// ---------------------------------------------------------------------------

/// Filter shape shared by `ListEvents`/`ListNotifications` and the
/// mark/delete bulk operations. All fields optional; an entirely-empty
/// filter (with `all == false`) matches nothing for mutating operations
/// (the anti-broad-sweep guard) but matches everything for reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    /// `notify_only` on events, `unseen` on notifications — the broker maps
    /// whichever request field is present into this single slot per table.
    #[serde(default)]
    pub restrict: bool,
    #[serde(default)]
    pub all: bool,
}

impl Filter {
    /// True when no scoping field is set (subject to `all`/`restrict`).
    /// Used by the anti-broad-sweep guard on delete/mark-all operations.
    pub fn is_unscoped(&self) -> bool {
        self.service.is_none()
            && self.bot.is_none()
            && self.target.is_none()
            && self.channel.is_none()
            && self.thread.is_none()
            && self.search.is_none()
            && self.since_id.is_none()
            && !self.restrict
    }
}

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Ping,
    Bots,
    Send,
    History,
    Notifications,
    ClearNotifications,
    ClearHistory,
    Subscribe,
    Reload,
}

/// A single framed request read off the control socket.
///
/// All non-`action` fields are optional; each action interprets the subset
/// it needs (see spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unseen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_id: Option<i64>,
}

impl Request {
    pub fn ping() -> Self {
        Request::bare(Action::Ping)
    }

    fn bare(action: Action) -> Self {
        Request {
            action,
            service: None,
            bot: None,
            target: None,
            channel: None,
            thread: None,
            text: None,
            search: None,
            notify: None,
            unseen: None,
            all: None,
            notification_id: None,
            limit: None,
            since_id: None,
        }
    }
}

/// The single response shape for every action. `ok = false` never carries
/// `events`/`event`/`bots`/`cleared`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bots: Option<Vec<BotRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared: Option<u64>,
}

impl Response {
    pub fn ok() -> Self {
        Response { ok: true, ..Default::default() }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Response { ok: false, error: Some(msg.into()), ..Default::default() }
    }

    pub fn ack(ack: impl Into<String>) -> Self {
        Response { ok: true, ack: Some(ack.into()), ..Default::default() }
    }
}

/// A single frame pushed to a `subscribe` client: either the one-time
/// acknowledgement or a subsequent event. Framed identically to `Response`
/// so a client reading newline-delimited JSON can distinguish by field
/// presence (an event frame carries `event`, the ack frame carries `ack`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionFrame {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
}

impl SubscriptionFrame {
    pub fn ack(ack: impl Into<String>) -> Self {
        SubscriptionFrame { ok: true, error: None, ack: Some(ack.into()), event: None }
    }

    pub fn event(event: Event) -> Self {
        SubscriptionFrame { ok: true, error: None, ack: None, event: Some(event) }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        SubscriptionFrame { ok: false, error: Some(msg.into()), ack: None, event: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_key_empty_for_all_blank() {
        assert_eq!(route_key("", "", ""), "");
    }

    #[test]
    fn route_key_nonempty_when_any_part_set() {
        assert_eq!(route_key("", "C1", ""), "t=|c=C1|th=");
    }

    #[test]
    fn request_roundtrips_through_json() {
        let req = Request {
            text: Some("hello".into()),
            ..Request::bare(Action::Send)
        };
        let s = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&s).unwrap();
        assert_eq!(back.action, Action::Send);
        assert_eq!(back.text.as_deref(), Some("hello"));
    }

    #[test]
    fn event_serializes_with_wire_field_names() {
        let mut e = Event::new("slack", "ops-bot", "message");
        e.mentions = true;
        e.direct = false;
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["mentions_agent"], serde_json::json!(true));
        assert_eq!(v["direct_to_agent"], serde_json::json!(false));
        assert!(v.get("seen_at").is_none());
    }

    #[test]
    fn filter_is_unscoped_when_empty() {
        let f = Filter::default();
        assert!(f.is_unscoped());
        let f2 = Filter { bot: Some("ops-bot".into()), ..Default::default() };
        assert!(!f2.is_unscoped());
    }
}
