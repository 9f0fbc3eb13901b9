//! The broker's core: owns the store, the connector generation, the agent
//! runners, and the tick source, and implements the publish pipeline and
//! every RPC action's business logic (spec §4.4-§4.6). `rpc.rs` is the only
//! caller of these methods; it owns framing, this owns semantics.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cb_connector::SendRequest;
use cb_protocol::{BotRef, Event, Filter, Notification};
use cb_store::Store;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentConfig as RunnerAgentConfig, AgentRunner};
use crate::classify;
use crate::connectors;
use crate::error::{BrokerError, BrokerResult};
use crate::state::{event_route_key, BotEntry, SharedState};
use crate::subscriptions::{SubFilter, SubscriptionHandle};
use crate::supervisor::Generation;

/// Shared broker state plus the handles that change across a reload.
struct Inner {
    state: SharedState,
    store: Store,
    root_cancel: CancellationToken,
    socket_path: String,
    db_path: String,
    config_path: PathBuf,
    generation: Mutex<Option<Generation>>,
    agents: std::sync::RwLock<Vec<Arc<AgentRunner>>>,
    tick_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Cheaply cloneable handle to the running broker; one instance is shared
/// by the RPC listener across every connection and every connector's
/// publish callback.
#[derive(Clone)]
pub struct Broker(Arc<Inner>);

impl Broker {
    /// Load `config_path`, open the store, and bring up the initial
    /// connector generation, agent runners, and tick source.
    pub async fn bootstrap(config_path: PathBuf) -> BrokerResult<Broker> {
        let cfg = cb_config::load(&config_path)?;
        let store = Store::open(std::path::Path::new(&cfg.db_path))?;
        let inner = Arc::new(Inner {
            state: SharedState::new(),
            store,
            root_cancel: CancellationToken::new(),
            socket_path: cfg.socket_path.clone(),
            db_path: cfg.db_path.clone(),
            config_path,
            generation: Mutex::new(None),
            agents: std::sync::RwLock::new(Vec::new()),
            tick_handle: Mutex::new(None),
        });
        let broker = Broker(inner);
        broker.apply_config(&cfg)?;
        Ok(broker)
    }

    pub fn socket_path(&self) -> &str {
        &self.0.socket_path
    }

    pub fn root_cancel(&self) -> CancellationToken {
        self.0.root_cancel.clone()
    }

    // -----------------------------------------------------------------------
    // Publish pipeline (spec §4.4 steps 2-6)
    // -----------------------------------------------------------------------

    /// Classify, persist (if applicable), and fan out an event produced by
    /// `bot_key`'s connector. Returns the finalized event (with assigned
    /// `id`/`notification_id` if it was persisted).
    fn publish(&self, bot_key: &str, mut event: Event) -> Event {
        let (service, name, identity) = {
            let maps = self.0.state.maps.read().unwrap();
            match maps.bots.get(bot_key) {
                Some(entry) => (entry.service.clone(), entry.name.clone(), entry.connector.identity()),
                None => {
                    warn!(bot_key, "publish from unknown bot key, dropping (stale connector generation?)");
                    return event;
                }
            }
        };
        event.service = service;
        event.bot = name.clone();
        event.is_self = !identity.is_empty() && event.user == identity;
        event.mentions = classify::mentions(&event.text, &name, &identity);
        event.direct = classify::direct(&event.kind, &event.target, &event.channel);

        let route_key = event_route_key(&event);
        let has_participation = self.0.state.maps.read().unwrap().has_participation(bot_key, &route_key);
        event.notify = classify::notify(&event.direction, event.is_self, event.direct, event.mentions, has_participation);

        if event.kind == "message" {
            match self.0.store.insert_event(&event) {
                Ok(id) => {
                    event.id = id;
                    if event.notify {
                        match self.0.store.insert_notification(&event) {
                            Ok(nid) => {
                                event.notification_id = Some(nid);
                                event.seen = Some(false);
                            }
                            Err(e) => warn!(error = %e, "failed to insert notification"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to insert event, publishing without assigned id"),
            }
        }

        debug!(
            bot_key,
            kind = %event.kind,
            direction = %event.direction,
            notify = event.notify,
            "publish"
        );
        self.0.state.subs.publish(bot_key, &event);
        for agent in self.0.agents.read().unwrap().iter() {
            agent.offer(&event);
        }
        event
    }

    // -----------------------------------------------------------------------
    // RPC action handlers
    // -----------------------------------------------------------------------

    pub fn bots(&self) -> Vec<BotRef> {
        let maps = self.0.state.maps.read().unwrap();
        let mut out: Vec<BotRef> = maps
            .bots
            .values()
            .map(|entry| BotRef {
                service: entry.service.clone(),
                name: entry.name.clone(),
                bot_id: entry.connector.identity(),
                display_name: None,
            })
            .collect();
        out.sort_by(|a, b| (a.service.as_str(), a.name.as_str()).cmp(&(b.service.as_str(), b.name.as_str())));
        out
    }

    /// `send` RPC: resolve the target bot, validate routing fields, resolve
    /// a thread-only send's channel from history, hand off to the
    /// connector, mark participation, and run the result through publish.
    pub async fn send(
        &self,
        service: Option<&str>,
        bot: Option<&str>,
        target: Option<&str>,
        channel: Option<&str>,
        thread: Option<&str>,
        text: Option<&str>,
    ) -> Result<Event, String> {
        let bot = bot.ok_or("bot is required")?;
        let text = text.unwrap_or("").to_string();
        if text.trim().is_empty() {
            return Err("text is required".to_string());
        }
        let target = target.unwrap_or("").to_string();
        let mut channel = channel.unwrap_or("").to_string();
        let thread = thread.unwrap_or("").to_string();
        if target.is_empty() && channel.is_empty() && thread.is_empty() {
            return Err("one of target, channel, or thread is required".to_string());
        }

        let (bot_key, connector, svc_name, bot_name) = {
            let maps = self.0.state.maps.read().unwrap();
            let key = maps.resolve_one(service, bot)?;
            let entry = maps.bots.get(&key).expect("resolve_one returned a known key");
            (key, entry.connector.clone(), entry.service.clone(), entry.name.clone())
        };

        if target.is_empty() && channel.is_empty() && !thread.is_empty() {
            match self.0.store.lookup_channel_by_thread(&svc_name, &bot_name, &thread) {
                Ok(Some(found)) => channel = found,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "thread-to-channel lookup failed, sending without channel"),
            }
        }

        let req = SendRequest { target, channel, thread, text };
        let out = connector.send(req).await.map_err(|e| e.to_string())?;

        let route_key = event_route_key(&out);
        self.0.state.maps.write().unwrap().mark_participation(&bot_key, &route_key);

        Ok(self.publish(&bot_key, out))
    }

    pub fn history(&self, filter: &Filter) -> Result<Vec<Event>, String> {
        self.0.store.list_events(filter).map_err(|e| e.to_string())
    }

    pub fn notifications(&self, filter: &Filter) -> Result<Vec<Notification>, String> {
        self.0.store.list_notifications(filter).map_err(|e| e.to_string())
    }

    pub fn clear_history(&self, filter: &Filter) -> Result<u64, String> {
        self.0.store.delete_events(filter).map_err(|e| e.to_string())
    }

    pub fn clear_notifications(&self, filter: &Filter) -> Result<u64, String> {
        self.0.store.delete_notifications(filter).map_err(|e| e.to_string())
    }

    /// `clear_notifications` with `notification_id` set: clear exactly one
    /// notification by id rather than by filter.
    pub fn clear_notification_by_id(&self, id: i64) -> Result<u64, String> {
        self.0.store.delete_notification_by_id(id).map_err(|e| e.to_string())
    }

    pub fn resolve_selector(&self, service: Option<&str>, bot: Option<&str>) -> Result<Vec<String>, String> {
        self.0.state.maps.read().unwrap().resolve_selector(service, bot)
    }

    pub fn subscribe(
        &self,
        bot_keys: &[String],
        filter: SubFilter,
    ) -> (SubscriptionHandle, tokio::sync::mpsc::Receiver<Event>) {
        self.0.state.subs.register(bot_keys, filter)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.0.state.subs.deregister(handle);
    }

    // -----------------------------------------------------------------------
    // Reload / shutdown
    // -----------------------------------------------------------------------

    /// Reload the config (from `override_path` or the originally loaded
    /// path), rejecting any change to `socket_path`/`db_path`, then swap in
    /// a fresh connector generation, agent runner set, and tick source.
    pub async fn reload(&self, override_path: Option<PathBuf>) -> Result<(), String> {
        let path = override_path.unwrap_or_else(|| self.0.config_path.clone());
        let cfg = cb_config::load(&path).map_err(|e| e.to_string())?;
        if cfg.socket_path != self.0.socket_path || cfg.db_path != self.0.db_path {
            return Err(format!(
                "reload rejected: socket_path/db_path cannot change at runtime \
                 (running socket_path={}, db_path={}; new config has socket_path={}, db_path={})",
                self.0.socket_path, self.0.db_path, cfg.socket_path, cfg.db_path
            ));
        }
        self.apply_config(&cfg).map_err(|e| e.to_string())
    }

    pub async fn shutdown(&self) {
        self.0.root_cancel.cancel();
        let generation = self.0.generation.lock().unwrap().take();
        if let Some(generation) = generation {
            for handle in generation.handles {
                let _ = handle.await;
            }
        }
        if let Some(tick) = self.0.tick_handle.lock().unwrap().take() {
            tick.abort();
        }
    }

    fn apply_config(&self, cfg: &cb_config::Config) -> BrokerResult<()> {
        let mut bots = std::collections::HashMap::with_capacity(cfg.bots.len());
        let mut for_supervisor = Vec::with_capacity(cfg.bots.len());
        for bot in &cfg.bots {
            let key = bot.bot_key();
            let this = self.clone();
            let key_for_callback = key.clone();
            let publish: cb_connector::PublishFn =
                Arc::new(move |e| { this.publish(&key_for_callback, e); });
            let connector = connectors::build(bot, publish)?;
            for_supervisor.push((key.clone(), connector.clone()));
            bots.insert(key, BotEntry { service: bot.kind.clone(), name: bot.name.clone(), connector });
        }

        let mut agents = Vec::with_capacity(cfg.agents.len());
        for a in &cfg.agents {
            let predicate = cb_eval::compile(&a.when)
                .map_err(|source| BrokerError::Predicate { agent: a.name.clone(), source })?;
            agents.push(AgentRunner::new(RunnerAgentConfig {
                name: a.name.clone(),
                predicate,
                command: a.command.clone(),
                workdir: a.workdir.clone(),
                buffer: std::time::Duration::from_secs(a.buffer_secs),
                timeout: std::time::Duration::from_secs(a.timeout_secs),
                cooldown: std::time::Duration::from_secs(a.cooldown_secs),
            }));
        }

        {
            let mut maps = self.0.state.maps.write().unwrap();
            maps.bots = bots;
            maps.participation.clear();
        }
        *self.0.agents.write().unwrap() = agents.clone();

        let new_generation = Generation::spawn(&self.0.root_cancel, for_supervisor);
        let old_generation = self.0.generation.lock().unwrap().replace(new_generation);
        if let Some(old) = old_generation {
            old.retire();
        }

        if let Some(old_tick) = self.0.tick_handle.lock().unwrap().take() {
            old_tick.abort();
        }
        let tick_cancel = self.0.root_cancel.child_token();
        *self.0.tick_handle.lock().unwrap() = crate::tick::maybe_start(&agents, tick_cancel);

        info!(bots = cfg.bots.len(), agents = cfg.agents.len(), "broker config applied");
        Ok(())
    }
}
