//! Minute-resolution synthetic event source (spec §4.6 "Tick source").
//! Started only when at least one agent runner's raw predicate text needs
//! it; ticks are never persisted, only offered to every runner's matcher.

use std::sync::Arc;
use std::time::Duration;

use cb_protocol::Event;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::AgentRunner;

const TICK_PERIOD: Duration = Duration::from_secs(60);

/// Spawn the ticker if any runner needs it; returns `None` otherwise.
pub fn maybe_start(agents: &[Arc<AgentRunner>], cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
    if !agents.iter().any(|a| a.needs_tick()) {
        return None;
    }
    let agents: Vec<Arc<AgentRunner>> = agents.to_vec();
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        interval.tick().await; // first tick is immediate; consume it
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let tick = Event::new("", "", "tick");
                    debug!(timestamp = %tick.timestamp, "tick");
                    for agent in &agents {
                        agent.offer(&tick);
                    }
                }
            }
        }
    }))
}
