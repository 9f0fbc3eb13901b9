//! Broker-owned shared state: the connector map, subscription registry,
//! and participation set (spec §4.4's "owns" list, minus the listener and
//! store handle which `Broker` holds directly).

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use cb_connector::Connector;
use cb_protocol::{bot_key, Event};
use std::sync::Arc;

use crate::subscriptions::SubscriptionRegistry;

pub struct BotEntry {
    pub service: String,
    pub name: String,
    pub connector: Arc<dyn Connector>,
}

impl BotEntry {
    pub fn key(&self) -> String {
        bot_key(&self.service, &self.name)
    }
}

/// All structural broker state behind one read-write mutex, per spec §5's
/// "broker maps ... are protected by one read-write mutex" rule. Readers
/// take the read lock; reload/startup take the write lock.
#[derive(Default)]
pub struct BrokerMaps {
    pub bots: HashMap<String, BotEntry>,
    pub participation: HashMap<String, HashSet<String>>,
}

impl BrokerMaps {
    /// Resolve `(service, bot)` to exactly one bot key, applying the
    /// spec's "if service is empty and the bot name is unique across
    /// services, infer it; if ambiguous, fail" rule.
    pub fn resolve_one(&self, service: Option<&str>, bot: &str) -> Result<String, String> {
        if let Some(service) = service {
            let key = bot_key(service, bot);
            return if self.bots.contains_key(&key) {
                Ok(key)
            } else {
                Err(format!("unknown bot `{key}`"))
            };
        }
        let keys: Vec<String> =
            self.bots.iter().filter(|(_, e)| e.name == bot).map(|(k, _)| k.clone()).collect();
        match keys.len() {
            0 => Err(format!("unknown bot `{bot}`")),
            1 => Ok(keys.into_iter().next().unwrap()),
            _ => Err(format!("ambiguous bot `{bot}`: matches {}", keys.join(", "))),
        }
    }

    /// Resolve an RPC selector to zero or more bot keys: `(service, bot)` ->
    /// one key; `bot` only -> unique match or error; both empty -> all keys.
    pub fn resolve_selector(
        &self,
        service: Option<&str>,
        bot: Option<&str>,
    ) -> Result<Vec<String>, String> {
        match (service, bot) {
            (None, None) => Ok(self.bots.keys().cloned().collect()),
            (_, Some(bot)) => self.resolve_one(service, bot).map(|k| vec![k]),
            (Some(_), None) => Err("selector with a service but no bot is not supported".to_string()),
        }
    }

    pub fn has_participation(&self, bot_key: &str, route_key: &str) -> bool {
        if route_key.is_empty() {
            return false;
        }
        self.participation.get(bot_key).is_some_and(|routes| routes.contains(route_key))
    }

    pub fn mark_participation(&mut self, bot_key: &str, route_key: &str) {
        if route_key.is_empty() {
            return;
        }
        self.participation.entry(bot_key.to_string()).or_default().insert(route_key.to_string());
    }
}

/// Thread-safe wrapper combining the structural maps with the fan-out
/// registry, shared by every RPC connection, connector callback, and agent
/// runner.
pub struct SharedState {
    pub maps: RwLock<BrokerMaps>,
    pub subs: SubscriptionRegistry,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState { maps: RwLock::new(BrokerMaps::default()), subs: SubscriptionRegistry::new() }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn event_route_key(e: &Event) -> String {
    cb_protocol::route_key(&e.target, &e.channel, &e.thread)
}
