//! Polls a local macOS Messages database (`chat.db`) for new rows, the
//! shape of connector the spec calls out as "a local macOS iMessage SQLite
//! tail". `rusqlite` access is blocking, so each poll runs on
//! `spawn_blocking`, mirroring the teacher's pattern for its own embedded
//! SQLite store.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cb_connector::{Allowlist, Connector, ConnectorError, PublishFn, SendRequest};
use cb_protocol::Event;
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(3);

struct Row {
    rowid: i64,
    text: String,
    handle: String,
    chat: String,
}

pub struct IMessageConnector {
    db_path: PathBuf,
    allowlist: Allowlist,
    publish: PublishFn,
    last_rowid: AtomicI64,
    /// This machine's own handle, used for self-filtering; iMessage has no
    /// separate "identity" concept beyond the local account's handle.
    own_handle: String,
}

impl IMessageConnector {
    pub fn new(db_path: String, allowlist_channels: Vec<String>, publish: PublishFn) -> Self {
        IMessageConnector {
            db_path: PathBuf::from(db_path),
            allowlist: Allowlist::new(allowlist_channels),
            publish,
            last_rowid: AtomicI64::new(0),
            own_handle: String::new(),
        }
    }

    fn poll_blocking(path: &std::path::Path, since: i64) -> rusqlite::Result<Vec<Row>> {
        let conn = Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut stmt = conn.prepare(
            "SELECT rowid, COALESCE(text, ''), COALESCE(handle_id, ''), COALESCE(cache_roomnames, '')
             FROM message WHERE rowid > ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map([since], |r| {
            Ok(Row {
                rowid: r.get(0)?,
                text: r.get(1)?,
                handle: r.get(2)?,
                chat: r.get(3)?,
            })
        })?;
        rows.collect()
    }
}

fn status_event(text: &str) -> Event {
    let mut e = Event::new("", "", "status");
    e.direction = "system".to_string();
    e.text = text.to_string();
    e
}

#[async_trait]
impl Connector for IMessageConnector {
    async fn run(&self, cancel: CancellationToken) {
        (self.publish)(status_event("connector online"));
        info!(db_path = %self.db_path.display(), "imessage connector online");
        let mut heartbeat = tokio::time::interval(Duration::from_secs(45));
        heartbeat.tick().await;
        loop {
            let path = self.db_path.clone();
            let since = self.last_rowid.load(Ordering::Relaxed);
            let result = tokio::task::spawn_blocking(move || Self::poll_blocking(&path, since)).await;
            match result {
                Ok(Ok(rows)) => {
                    for row in rows {
                        self.last_rowid.fetch_max(row.rowid, Ordering::Relaxed);
                        if row.handle == self.own_handle && !self.own_handle.is_empty() {
                            continue;
                        }
                        if !self.allowlist.allows(&row.chat) {
                            continue;
                        }
                        let mut e = Event::new("", "", "message");
                        e.direction = "in".to_string();
                        e.user = row.handle;
                        e.channel = row.chat;
                        e.text = row.text;
                        (self.publish)(e);
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "imessage poll failed"),
                Err(e) => warn!(error = %e, "imessage poll task panicked"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = heartbeat.tick() => {
                    (self.publish)(Event::new("", "", "heartbeat"));
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn send(&self, _req: SendRequest) -> Result<Event, ConnectorError> {
        // Sending requires driving the Messages.app AppleScript bridge,
        // which is out of scope for a plausible-depth polling connector.
        Err(ConnectorError::Unsupported("imessage: outbound send not implemented".to_string()))
    }

    fn identity(&self) -> String {
        self.own_handle.clone()
    }
}
