//! Durable, append-only event and notification store.
//!
//! Single embedded SQLite file (via `rusqlite`, bundled). Writes serialize
//! through the store's own mutex; `Store` is `Send + Sync` and cloned
//! cheaply (it's an `Arc` around the connection) so the broker can hand one
//! handle to every connector callback and RPC connection.

use std::path::Path;
use std::sync::{Arc, Mutex};

use cb_protocol::{Event, Filter, Notification};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, ToSql, params_from_iter};
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("refusing broad {0}: no filter given and `all` not set")]
    RefusingBroadSweep(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path`, applying durability pragmas and
    /// an idempotent `CREATE IF NOT EXISTS` schema migration.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA wal_autocheckpoint=1000; PRAGMA foreign_keys=ON;",
        )?;
        let check: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if check != "ok" {
            return Err(StoreError::IntegrityCheckFailed(check));
        }
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store { inner: Arc::new(Mutex::new(conn)) })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append `e` to the events table and return its assigned id.
    pub fn insert_event(&self, e: &Event) -> StoreResult<i64> {
        let conn = self.inner.lock().unwrap();
        conn.execute(
            "INSERT INTO events
                (timestamp, service, bot, kind, direction, user, is_self,
                 target, channel, thread, text, mentions, direct, notify)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            rusqlite::params![
                e.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                e.service,
                e.bot,
                e.kind,
                e.direction,
                e.user,
                e.is_self,
                e.target,
                e.channel,
                e.thread,
                e.text,
                e.mentions,
                e.direct,
                e.notify,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a notification referencing an already-inserted event.
    /// `e.id` must be the event's assigned id.
    pub fn insert_notification(&self, e: &Event) -> StoreResult<i64> {
        let conn = self.inner.lock().unwrap();
        conn.execute(
            "INSERT INTO notifications
                (event_id, timestamp, service, bot, target, channel, thread, text,
                 mentions, direct, notify, seen, seen_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,1,0,NULL)",
            rusqlite::params![
                e.id,
                e.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                e.service,
                e.bot,
                e.target,
                e.channel,
                e.thread,
                e.text,
                e.mentions,
                e.direct,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Idempotent: marks the notification seen; returns 1 if a row flipped,
    /// 0 if it was already seen or did not exist.
    pub fn mark_seen_by_id(&self, id: i64) -> StoreResult<u64> {
        let conn = self.inner.lock().unwrap();
        let now = now_rfc3339();
        let n = conn.execute(
            "UPDATE notifications SET seen = 1, seen_at = ?2 WHERE id = ?1 AND seen = 0",
            rusqlite::params![id, now],
        )?;
        Ok(n as u64)
    }

    /// Idempotent: deletes a single notification by id; returns 1 if a row
    /// was removed, 0 if it did not exist (already cleared or never did).
    pub fn delete_notification_by_id(&self, id: i64) -> StoreResult<u64> {
        let conn = self.inner.lock().unwrap();
        let n = conn.execute("DELETE FROM notifications WHERE id = ?1", rusqlite::params![id])?;
        Ok(n as u64)
    }

    /// Bulk mark-seen over a filter. Refuses an unscoped filter unless `all`.
    pub fn mark_seen(&self, filter: &Filter) -> StoreResult<u64> {
        if filter.is_unscoped() && !filter.all {
            return Err(StoreError::RefusingBroadSweep("mark"));
        }
        let (clause, binds) = where_clause(filter, "seen", false);
        let conn = self.inner.lock().unwrap();
        let now = now_rfc3339();
        let sql = format!("UPDATE notifications SET seen = 1, seen_at = ?1 WHERE seen = 0 {clause}");
        let mut params: Vec<&dyn ToSql> = vec![&now];
        params.extend(binds.iter().map(|b| b.as_ref()));
        let n = conn.execute(&sql, params_from_iter(params.into_iter()))?;
        Ok(n as u64)
    }

    /// Delete matching events. Refuses an unscoped filter unless `all`.
    pub fn delete_events(&self, filter: &Filter) -> StoreResult<u64> {
        if filter.is_unscoped() && !filter.all {
            return Err(StoreError::RefusingBroadSweep("clear"));
        }
        let (clause, binds) = where_clause(filter, "notify", true);
        let conn = self.inner.lock().unwrap();
        let sql = format!("DELETE FROM events WHERE 1=1 {clause}");
        let n = conn.execute(&sql, params_from_iter(binds.iter().map(|b| b.as_ref())))?;
        Ok(n as u64)
    }

    /// Delete matching notifications. Refuses an unscoped filter unless `all`.
    pub fn delete_notifications(&self, filter: &Filter) -> StoreResult<u64> {
        if filter.is_unscoped() && !filter.all {
            return Err(StoreError::RefusingBroadSweep("clear"));
        }
        let (clause, binds) = where_clause(filter, "seen", false);
        let conn = self.inner.lock().unwrap();
        let sql = format!("DELETE FROM notifications WHERE 1=1 {clause}");
        let n = conn.execute(&sql, params_from_iter(binds.iter().map(|b| b.as_ref())))?;
        Ok(n as u64)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Up to `filter.limit` (default 50) most-recent matching events, in
    /// chronological ascending order.
    pub fn list_events(&self, filter: &Filter) -> StoreResult<Vec<Event>> {
        let (clause, binds) = where_clause(filter, "notify", true);
        let limit = filter.limit.unwrap_or(cb_protocol::DEFAULT_HISTORY_LIMIT).max(0);
        let sql = format!(
            "SELECT id, timestamp, service, bot, kind, direction, user, is_self,
                    target, channel, thread, text, mentions, direct, notify
             FROM events WHERE 1=1 {clause} ORDER BY id DESC LIMIT ?"
        );
        let conn = self.inner.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let mut all_binds: Vec<&dyn ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        all_binds.push(&limit);
        let rows = stmt.query_map(params_from_iter(all_binds.into_iter()), map_event)?;
        let mut out: Vec<Event> = rows.collect::<Result<_, _>>()?;
        out.reverse();
        Ok(out)
    }

    /// Up to `filter.limit` (default 50) most-recent matching notifications,
    /// in chronological ascending order. `filter.restrict` means "unseen only".
    pub fn list_notifications(&self, filter: &Filter) -> StoreResult<Vec<Notification>> {
        let (clause, binds) = where_clause(filter, "seen", false);
        let limit = filter.limit.unwrap_or(cb_protocol::DEFAULT_HISTORY_LIMIT).max(0);
        let sql = format!(
            "SELECT id, event_id, timestamp, service, bot, target, channel, thread, text,
                    mentions, direct, notify, seen, seen_at
             FROM notifications WHERE 1=1 {clause} ORDER BY id DESC LIMIT ?"
        );
        let conn = self.inner.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let mut all_binds: Vec<&dyn ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        all_binds.push(&limit);
        let rows = stmt.query_map(params_from_iter(all_binds.into_iter()), map_notification)?;
        let mut out: Vec<Notification> = rows.collect::<Result<_, _>>()?;
        out.reverse();
        Ok(out)
    }

    /// The channel of the most recent event matching `(service, bot, thread)`,
    /// used by the broker to auto-resolve channel on thread-only sends.
    pub fn lookup_channel_by_thread(
        &self,
        service: &str,
        bot: &str,
        thread: &str,
    ) -> StoreResult<Option<String>> {
        let conn = self.inner.lock().unwrap();
        let channel: Option<String> = conn
            .query_row(
                "SELECT channel FROM events WHERE service = ?1 AND bot = ?2 AND thread = ?3
                 ORDER BY id DESC LIMIT 1",
                rusqlite::params![service, bot, thread],
                |row| row.get(0),
            )
            .optional()?;
        Ok(channel)
    }
}

// ---------------------------------------------------------------------------
// Filter -> SQL
// ---------------------------------------------------------------------------

/// Build a `AND ...` clause (leading space) plus its positional binds, for
/// either the `events` table (`restrict_col = "notify"`, has `kind`) or the
/// `notifications` table (`restrict_col = "seen"`).
fn where_clause(filter: &Filter, restrict_col: &str, restrict_means_true: bool) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clause = String::new();
    let mut binds: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(service) = &filter.service {
        clause.push_str(" AND service = ?");
        binds.push(Box::new(service.clone()));
    }
    if let Some(bot) = &filter.bot {
        clause.push_str(" AND bot = ?");
        binds.push(Box::new(bot.clone()));
    }
    if let Some(target) = &filter.target {
        clause.push_str(" AND target = ?");
        binds.push(Box::new(target.clone()));
    }
    if let Some(channel) = &filter.channel {
        clause.push_str(" AND channel = ?");
        binds.push(Box::new(channel.clone()));
    }
    if let Some(thread) = &filter.thread {
        clause.push_str(" AND thread = ?");
        binds.push(Box::new(thread.clone()));
    }
    if let Some(search) = &filter.search {
        clause.push_str(" AND text LIKE ? ESCAPE '\\'");
        binds.push(Box::new(format!("%{}%", escape_like(search))));
    }
    if let Some(since_id) = filter.since_id {
        clause.push_str(" AND id > ?");
        binds.push(Box::new(since_id));
    }
    if filter.restrict {
        let val = if restrict_means_true { 1 } else { 0 };
        clause.push_str(&format!(" AND {restrict_col} = {val}"));
    }

    (clause, binds)
}

/// Case-insensitive substring search: SQLite's `LIKE` is ASCII
/// case-insensitive by default, which matches the spec's "case-insensitive
/// substring" requirement without a custom collation.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        timestamp: parse_ts(row.get(1)?),
        service: row.get(2)?,
        bot: row.get(3)?,
        kind: row.get(4)?,
        direction: row.get(5)?,
        user: row.get(6)?,
        is_self: row.get(7)?,
        target: row.get(8)?,
        channel: row.get(9)?,
        thread: row.get(10)?,
        text: row.get(11)?,
        mentions: row.get(12)?,
        direct: row.get(13)?,
        notify: row.get(14)?,
        notification_id: None,
        seen: None,
        seen_at: None,
    })
}

fn map_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let seen_at: Option<String> = row.get(13)?;
    Ok(Notification {
        id: row.get(0)?,
        event_id: row.get(1)?,
        timestamp: parse_ts(row.get(2)?),
        service: row.get(3)?,
        bot: row.get(4)?,
        target: row.get(5)?,
        channel: row.get(6)?,
        thread: row.get(7)?,
        text: row.get(8)?,
        mentions: row.get(9)?,
        direct: row.get(10)?,
        notify: row.get(11)?,
        seen: row.get(12)?,
        seen_at: seen_at.map(parse_ts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(service: &str, bot: &str, text: &str) -> Event {
        let mut e = Event::new(service, bot, "message");
        e.direction = "in".to_string();
        e.text = text.to_string();
        e.channel = "C1".to_string();
        e
    }

    #[test]
    fn insert_assigns_strictly_increasing_ids() {
        let store = Store::open_in_memory().unwrap();
        let id1 = store.insert_event(&sample_event("slack", "ops-bot", "one")).unwrap();
        let id2 = store.insert_event(&sample_event("slack", "ops-bot", "two")).unwrap();
        assert!(id2 > id1);
    }

    #[test]
    fn list_events_returns_chronological_ascending() {
        let store = Store::open_in_memory().unwrap();
        store.insert_event(&sample_event("slack", "ops-bot", "one")).unwrap();
        store.insert_event(&sample_event("slack", "ops-bot", "two")).unwrap();
        let filter = Filter { bot: Some("ops-bot".into()), limit: Some(10), ..Default::default() };
        let events = store.list_events(&filter).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].text, "one");
        assert_eq!(events[1].text, "two");
        assert!(events[0].id < events[1].id);
    }

    #[test]
    fn mark_seen_by_id_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let eid = store.insert_event(&sample_event("slack", "ops-bot", "hi")).unwrap();
        let mut e = sample_event("slack", "ops-bot", "hi");
        e.id = eid;
        let nid = store.insert_notification(&e).unwrap();

        assert_eq!(store.mark_seen_by_id(nid).unwrap(), 1);
        assert_eq!(store.mark_seen_by_id(nid).unwrap(), 0);

        let filter = Filter { bot: Some("ops-bot".into()), restrict: true, limit: Some(10), ..Default::default() };
        let unseen = store.list_notifications(&filter).unwrap();
        assert!(unseen.iter().all(|n| n.id != nid));
    }

    #[test]
    fn delete_notification_by_id_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let eid = store.insert_event(&sample_event("slack", "ops-bot", "hi")).unwrap();
        let mut e = sample_event("slack", "ops-bot", "hi");
        e.id = eid;
        let nid = store.insert_notification(&e).unwrap();

        assert_eq!(store.delete_notification_by_id(nid).unwrap(), 1);
        assert_eq!(store.delete_notification_by_id(nid).unwrap(), 0);
    }

    #[test]
    fn delete_with_no_filter_and_no_all_is_refused() {
        let store = Store::open_in_memory().unwrap();
        store.insert_event(&sample_event("slack", "ops-bot", "one")).unwrap();
        let err = store.delete_events(&Filter::default()).unwrap_err();
        assert!(matches!(err, StoreError::RefusingBroadSweep(_)));
        let filter = Filter { bot: Some("ops-bot".into()), limit: Some(10), ..Default::default() };
        assert_eq!(store.list_events(&filter).unwrap().len(), 1);
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let store = Store::open_in_memory().unwrap();
        store.insert_event(&sample_event("slack", "ops-bot", "Deploy Finished")).unwrap();
        let filter = Filter { search: Some("deploy".into()), limit: Some(10), ..Default::default() };
        assert_eq!(store.list_events(&filter).unwrap().len(), 1);
    }

    #[test]
    fn lookup_channel_by_thread_finds_most_recent() {
        let store = Store::open_in_memory().unwrap();
        let mut e = sample_event("slack", "ops-bot", "one");
        e.thread = "T1".into();
        e.channel = "C-old".into();
        store.insert_event(&e).unwrap();
        let mut e2 = sample_event("slack", "ops-bot", "two");
        e2.thread = "T1".into();
        e2.channel = "C-new".into();
        store.insert_event(&e2).unwrap();

        let ch = store.lookup_channel_by_thread("slack", "ops-bot", "T1").unwrap();
        assert_eq!(ch.as_deref(), Some("C-new"));
    }
}
