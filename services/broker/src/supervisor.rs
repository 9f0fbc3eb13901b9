//! Spawns and tracks one task per connector generation (spec component
//! table: "construct, run with reconnect-and-backoff, propagate heartbeats
//! and status events, cancel on reload or shutdown"). The reconnect loop
//! itself lives inside each `Connector::run` implementation; the
//! supervisor's job is just lifecycle: spawn, track, cancel, await.

use std::sync::Arc;

use cb_connector::Connector;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A running connector generation: the cancellation token that stops it
/// and the join handles to await during teardown.
pub struct Generation {
    pub cancel: CancellationToken,
    pub handles: Vec<JoinHandle<()>>,
}

impl Generation {
    pub fn spawn(parent: &CancellationToken, connectors: Vec<(String, Arc<dyn Connector>)>) -> Self {
        let cancel = parent.child_token();
        let mut handles = Vec::with_capacity(connectors.len());
        for (bot_key, connector) in connectors {
            let child_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                info!(bot_key = %bot_key, "connector starting");
                connector.run(child_cancel).await;
                info!(bot_key = %bot_key, "connector stopped");
            }));
        }
        Generation { cancel, handles }
    }

    /// Cancel this generation and detach its tasks — they'll finish
    /// observing cancellation on their own time; we don't block the caller
    /// (typically a reload in progress) waiting for slow upstream teardown.
    pub fn retire(self) {
        self.cancel.cancel();
        tokio::spawn(async move {
            for handle in self.handles {
                let _ = handle.await;
            }
        });
    }
}
