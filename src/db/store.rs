//! SQLite database store implementation.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{
    params, Connection, OptionalExtension, Result as SqlResult, Row, TransactionBehavior,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::query::Info;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Status CRUD ---

    /// Add a new status and return its ID.
    pub fn add_status(&self, status: &mut Status) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO status (scope_id, label, enabled_at) VALUES (?1, ?2, ?3)",
            params![
                status.scope_id,
                status.label,
                status.enabled_at.map(fmt_time),
            ],
        )?;
        let id = conn.last_insert_rowid();
        status.status_id = id;
        Ok(id)
    }

    /// Get a status by ID, without relationships.
    pub fn get_status(&self, status_id: i64) -> Result<Status, DbError> {
        let conn = self.conn.lock().unwrap();
        let status = conn
            .query_row(
                "SELECT status_id, scope_id, label, title, address, thumbnail, game, map, \
                 mods, version, enabled_at, failed_at FROM status WHERE status_id = ?1",
                params![status_id],
                status_from_row,
            )
            .optional()?;
        status.ok_or(DbError::NotFound)
    }

    /// Get all enabled statuses with their enabled queries, alerts and
    /// displays eagerly loaded. Queries are ordered by priority.
    pub fn get_enabled_statuses(&self) -> Result<Vec<Status>, DbError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT status_id, scope_id, label, title, address, thumbnail, game, map, \
             mods, version, enabled_at, failed_at FROM status WHERE enabled_at IS NOT NULL",
        )?;
        let mut statuses = stmt
            .query_map([], status_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT status_query_id, status_id, host, game_port, query_port, kind, \
             priority, enabled_at, failed_at, extra FROM status_query \
             WHERE enabled_at IS NOT NULL ORDER BY priority, status_query_id",
        )?;
        let mut queries: HashMap<i64, Vec<StatusQuery>> = HashMap::new();
        for query in stmt.query_map([], query_from_row)? {
            let query = query?;
            queries.entry(query.status_id).or_default().push(query);
        }

        let mut stmt = conn.prepare(
            "SELECT status_alert_id, status_id, channel_id, enabled_at, failed_at, \
             send_audit, send_downtime FROM status_alert WHERE enabled_at IS NOT NULL",
        )?;
        let mut alerts: HashMap<i64, Vec<StatusAlert>> = HashMap::new();
        for alert in stmt.query_map([], alert_from_row)? {
            let alert = alert?;
            alerts.entry(alert.status_id).or_default().push(alert);
        }

        let mut stmt = conn.prepare(
            "SELECT message_id, status_id, enabled_at, failed_at FROM status_display \
             WHERE enabled_at IS NOT NULL",
        )?;
        let mut displays: HashMap<i64, Vec<StatusDisplay>> = HashMap::new();
        for display in stmt.query_map([], display_from_row)? {
            let display = display?;
            displays.entry(display.status_id).or_default().push(display);
        }

        for status in &mut statuses {
            status.queries = queries.remove(&status.status_id).unwrap_or_default();
            status.alerts = alerts.remove(&status.status_id).unwrap_or_default();
            status.displays = displays.remove(&status.status_id).unwrap_or_default();
        }

        Ok(statuses)
    }

    // --- Query configuration ---

    /// Add a query configuration and return its ID.
    pub fn add_query(&self, query: &mut StatusQuery) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO status_query (status_id, host, game_port, query_port, kind, \
             priority, enabled_at, extra) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                query.status_id,
                query.host,
                query.game_port,
                query.query_port,
                query.kind.as_str(),
                query.priority,
                query.enabled_at.map(fmt_time),
                query.extra,
            ],
        )?;
        let id = conn.last_insert_rowid();
        query.status_query_id = id;
        Ok(id)
    }

    /// Record a failed query attempt, keeping the first failure time.
    ///
    /// Returns the effective failure timestamp, so the caller can decide
    /// whether the dead-after window has elapsed.
    pub fn set_query_failed(
        &self,
        status_query_id: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, DbError> {
        let conn = self.conn.lock().unwrap();
        let failed_at: String = conn.query_row(
            "UPDATE status_query SET failed_at = COALESCE(failed_at, ?1) \
             WHERE status_query_id = ?2 RETURNING failed_at",
            params![fmt_time(now), status_query_id],
            |row| row.get(0),
        )?;
        Ok(parse_db_time(&failed_at).unwrap_or(now))
    }

    /// Clear a query's failure timestamp after a successful attempt.
    pub fn set_query_success(&self, status_query_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE status_query SET failed_at = NULL WHERE status_query_id = ?1",
            params![status_query_id],
        )?;
        Ok(())
    }

    /// Disable a query configuration. Re-enabling is an external action.
    pub fn disable_query(&self, status_query_id: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE status_query SET enabled_at = NULL, failed_at = ?1 \
             WHERE status_query_id = ?2",
            params![fmt_time(now), status_query_id],
        )?;
        Ok(())
    }

    /// Get a query configuration by ID.
    pub fn get_query(&self, status_query_id: i64) -> Result<StatusQuery, DbError> {
        let conn = self.conn.lock().unwrap();
        let query = conn
            .query_row(
                "SELECT status_query_id, status_id, host, game_port, query_port, kind, \
                 priority, enabled_at, failed_at, extra FROM status_query \
                 WHERE status_query_id = ?1",
                params![status_query_id],
                query_from_row,
            )
            .optional()?;
        query.ok_or(DbError::NotFound)
    }

    // --- Alert sinks ---

    /// Add an alert sink and return its ID.
    pub fn add_alert(&self, alert: &mut StatusAlert) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO status_alert (status_id, channel_id, enabled_at, send_audit, \
             send_downtime) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                alert.status_id,
                alert.channel_id,
                alert.enabled_at.map(fmt_time),
                alert.send_audit,
                alert.send_downtime,
            ],
        )?;
        let id = conn.last_insert_rowid();
        alert.status_alert_id = id;
        Ok(id)
    }

    /// Get the enabled alert sinks for a status that subscribe to audit
    /// notices (true) or downtime notices (false).
    pub fn get_alert_sinks(&self, status_id: i64, audit: bool) -> Result<Vec<StatusAlert>, DbError> {
        let column = if audit { "send_audit" } else { "send_downtime" };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT status_alert_id, status_id, channel_id, enabled_at, failed_at, \
             send_audit, send_downtime FROM status_alert \
             WHERE status_id = ?1 AND enabled_at IS NOT NULL AND {} = 1",
            column
        ))?;
        let alerts = stmt
            .query_map(params![status_id], alert_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alerts)
    }

    /// Disable an alert sink.
    pub fn disable_alert(&self, status_alert_id: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE status_alert SET enabled_at = NULL, failed_at = ?1 \
             WHERE status_alert_id = ?2",
            params![fmt_time(now), status_alert_id],
        )?;
        Ok(())
    }

    // --- Display sinks ---

    /// Add a display sink.
    pub fn add_display(&self, display: &StatusDisplay) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO status_display (message_id, status_id, enabled_at) \
             VALUES (?1, ?2, ?3)",
            params![
                display.message_id,
                display.status_id,
                display.enabled_at.map(fmt_time),
            ],
        )?;
        Ok(())
    }

    /// Record a failed display refresh, keeping the first failure time.
    pub fn set_display_failed(&self, message_id: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE status_display SET failed_at = COALESCE(failed_at, ?1) \
             WHERE message_id = ?2",
            params![fmt_time(now), message_id],
        )?;
        Ok(())
    }

    /// Clear a display's failure timestamp.
    pub fn set_display_success(&self, message_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE status_display SET failed_at = NULL WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    /// Disable a display sink.
    pub fn disable_display(&self, message_id: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE status_display SET enabled_at = NULL, failed_at = ?1 \
             WHERE message_id = ?2",
            params![fmt_time(now), message_id],
        )?;
        Ok(())
    }

    // --- History ---

    /// Delete history rows past their retention windows.
    ///
    /// Roster rows expire independently of (and much sooner than) their
    /// parent history rows, since they are bulky and lose value quickly.
    pub fn prune_history(
        &self,
        status_id: i64,
        now: DateTime<Utc>,
        expires_after: Duration,
        players_expire_after: Duration,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM status_history WHERE status_id = ?1 AND created_at < ?2",
            params![status_id, fmt_time(now - expires_after)],
        )?;
        conn.execute(
            "DELETE FROM status_history_player WHERE status_history_player_id IN \
             (SELECT status_history_player_id FROM status_history_player \
             JOIN status_history USING (status_history_id) \
             WHERE status_id = ?1 AND created_at < ?2)",
            params![status_id, fmt_time(now - players_expire_after)],
        )?;
        Ok(())
    }

    /// Record an offline observation for a status.
    ///
    /// Returns the downtime state computed before the new row was
    /// inserted; the caller decides whether a notification fires. The
    /// check and insert share one write-intent transaction so overlapping
    /// cycles cannot both observe the pre-downtime state.
    pub fn record_offline(
        &self,
        status_id: i64,
        now: DateTime<Utc>,
    ) -> Result<DowntimeState, DbError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let state = check_downtime(&tx, status_id)?;
        let down = matches!(
            state,
            DowntimeState::Downtime | DowntimeState::PendingDowntime
        );
        tx.execute(
            "INSERT INTO status_history (created_at, status_id, online, down) \
             VALUES (?1, ?2, 0, ?3)",
            params![fmt_time(now), status_id, down],
        )?;

        tx.commit()?;
        Ok(state)
    }

    /// Record a successful observation for a status.
    ///
    /// Updates the status's cached display fields (keeping the previous
    /// value wherever the new one is absent), inserts the history row and
    /// its roster, and returns the pre-insertion downtime state. A
    /// successful query always terminates downtime.
    pub fn record_online(
        &self,
        status_id: i64,
        now: DateTime<Utc>,
        info: &Info,
    ) -> Result<DowntimeState, DbError> {
        let mods = info
            .mods
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "UPDATE status SET \
             title     = COALESCE(?1, title), \
             address   = COALESCE(?2, address), \
             thumbnail = COALESCE(?3, thumbnail), \
             game      = COALESCE(?4, game), \
             map       = COALESCE(?5, map), \
             mods      = COALESCE(?6, mods), \
             version   = COALESCE(?7, version) \
             WHERE status_id = ?8",
            params![
                info.title,
                info.address,
                info.thumbnail,
                info.game,
                info.map,
                mods,
                info.version,
                status_id,
            ],
        )?;

        let state = check_downtime(&tx, status_id)?;
        tx.execute(
            "INSERT INTO status_history (created_at, status_id, online, down, \
             max_players, num_players) VALUES (?1, ?2, 1, 0, ?3, ?4)",
            params![fmt_time(now), status_id, info.max_players, info.num_players],
        )?;
        let history_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO status_history_player (status_history_id, name) \
                 VALUES (?1, ?2)",
            )?;
            for player in &info.players {
                if player.name.is_empty() {
                    continue;
                }
                stmt.execute(params![history_id, player.name])?;
            }
        }

        tx.commit()?;
        Ok(state)
    }

    /// Get the most recent history rows for a status, newest first.
    pub fn recent_history(
        &self,
        status_id: i64,
        limit: i64,
    ) -> Result<Vec<HistoryRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status_history_id, created_at, status_id, online, down, \
             max_players, num_players FROM status_history WHERE status_id = ?1 \
             ORDER BY status_history_id DESC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![status_id, limit], |row| {
                let created_at: String = row.get(1)?;
                Ok(HistoryRecord {
                    status_history_id: row.get(0)?,
                    created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
                    status_id: row.get(2)?,
                    online: row.get(3)?,
                    down: row.get(4)?,
                    max_players: row.get(5)?,
                    num_players: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Get the roster names recorded with a history row.
    pub fn history_players(&self, status_history_id: i64) -> Result<Vec<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM status_history_player WHERE status_history_id = ?1 \
             ORDER BY status_history_player_id",
        )?;
        let names = stmt
            .query_map(params![status_history_id], |row| row.get(0))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(names)
    }

    // --- Settings ---

    /// Get a setting value by name.
    pub fn get_setting(&self, name: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM setting WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a setting value.
    pub fn set_setting(&self, name: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO setting (name, value) VALUES (?1, ?2) \
             ON CONFLICT (name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        Ok(())
    }
}

/// Compute the downtime state from the two most recent history rows.
///
/// Called before inserting a new row; the caller decides for the new row
/// whether it continues uptime or escalates into downtime.
fn check_downtime(conn: &Connection, status_id: i64) -> Result<DowntimeState, DbError> {
    let mut stmt = conn.prepare(
        "SELECT online, down FROM status_history WHERE status_id = ?1 \
         ORDER BY status_history_id DESC LIMIT 2",
    )?;
    let recent = stmt
        .query_map(params![status_id], |row| {
            Ok(HistoryFlags {
                online: row.get(0)?,
                down: row.get(1)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(DowntimeState::classify(&recent))
}

fn status_from_row(row: &Row) -> SqlResult<Status> {
    let enabled_at: Option<String> = row.get(10)?;
    let failed_at: Option<String> = row.get(11)?;
    Ok(Status {
        status_id: row.get(0)?,
        scope_id: row.get(1)?,
        label: row.get(2)?,
        title: row.get(3)?,
        address: row.get(4)?,
        thumbnail: row.get(5)?,
        game: row.get(6)?,
        map: row.get(7)?,
        mods: row.get(8)?,
        version: row.get(9)?,
        enabled_at: enabled_at.as_deref().and_then(parse_db_time),
        failed_at: failed_at.as_deref().and_then(parse_db_time),
        queries: Vec::new(),
        alerts: Vec::new(),
        displays: Vec::new(),
    })
}

fn query_from_row(row: &Row) -> SqlResult<StatusQuery> {
    let kind: String = row.get(5)?;
    let kind = kind.parse::<QueryKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let enabled_at: Option<String> = row.get(7)?;
    let failed_at: Option<String> = row.get(8)?;
    Ok(StatusQuery {
        status_query_id: row.get(0)?,
        status_id: row.get(1)?,
        host: row.get(2)?,
        game_port: row.get(3)?,
        query_port: row.get(4)?,
        kind,
        priority: row.get(6)?,
        enabled_at: enabled_at.as_deref().and_then(parse_db_time),
        failed_at: failed_at.as_deref().and_then(parse_db_time),
        extra: row.get(9)?,
    })
}

fn alert_from_row(row: &Row) -> SqlResult<StatusAlert> {
    let enabled_at: Option<String> = row.get(3)?;
    let failed_at: Option<String> = row.get(4)?;
    Ok(StatusAlert {
        status_alert_id: row.get(0)?,
        status_id: row.get(1)?,
        channel_id: row.get(2)?,
        enabled_at: enabled_at.as_deref().and_then(parse_db_time),
        failed_at: failed_at.as_deref().and_then(parse_db_time),
        send_audit: row.get(5)?,
        send_downtime: row.get(6)?,
    })
}

fn display_from_row(row: &Row) -> SqlResult<StatusDisplay> {
    let enabled_at: Option<String> = row.get(2)?;
    let failed_at: Option<String> = row.get(3)?;
    Ok(StatusDisplay {
        message_id: row.get(0)?,
        status_id: row.get(1)?,
        enabled_at: enabled_at.as_deref().and_then(parse_db_time),
        failed_at: failed_at.as_deref().and_then(parse_db_time),
    })
}

/// Format a datetime for storage.
fn fmt_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Info, Player};
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn add_enabled_status(store: &Store) -> i64 {
        let mut status = Status {
            label: "Test".to_string(),
            enabled_at: Some(Utc::now()),
            ..Default::default()
        };
        store.add_status(&mut status).unwrap()
    }

    fn add_enabled_query(store: &Store, status_id: i64, priority: i64) -> i64 {
        let mut query = StatusQuery {
            status_query_id: 0,
            status_id,
            host: "play.example.com".to_string(),
            game_port: 2302,
            query_port: 2303,
            kind: QueryKind::Arma3,
            priority,
            enabled_at: Some(Utc::now()),
            failed_at: None,
            extra: String::new(),
        };
        store.add_query(&mut query).unwrap()
    }

    fn online_info() -> Info {
        Info {
            title: Some("Server".to_string()),
            address: "play.example.com:2302".to_string(),
            thumbnail: None,
            game: Some("Arma3".to_string()),
            map: Some("Altis".to_string()),
            mods: None,
            version: Some("2.18".to_string()),
            max_players: 64,
            num_players: 3,
            players: vec![
                Player::named("Alice"),
                Player::named(""),
                Player::named("Bob"),
            ],
        }
    }

    #[test]
    fn test_enabled_statuses_with_relationships() {
        let (_tmp, store) = open_store();
        let status_id = add_enabled_status(&store);
        let second = add_enabled_query(&store, status_id, 1);
        let first = add_enabled_query(&store, status_id, 0);

        // A disabled status is never loaded.
        let mut disabled = Status {
            label: "Disabled".to_string(),
            ..Default::default()
        };
        store.add_status(&mut disabled).unwrap();

        let statuses = store.get_enabled_statuses().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status_id, status_id);
        let ids: Vec<i64> = statuses[0]
            .queries
            .iter()
            .map(|q| q.status_query_id)
            .collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn test_query_failure_bookkeeping() {
        let (_tmp, store) = open_store();
        let status_id = add_enabled_status(&store);
        let query_id = add_enabled_query(&store, status_id, 0);

        let first = Utc::now() - Duration::hours(2);
        let failed_at = store.set_query_failed(query_id, first).unwrap();
        assert_eq!(failed_at, first);

        // A later failure keeps the original timestamp.
        let failed_at = store.set_query_failed(query_id, Utc::now()).unwrap();
        assert_eq!(failed_at, first);

        // Success clears it unconditionally.
        store.set_query_success(query_id).unwrap();
        assert!(store.get_query(query_id).unwrap().failed_at.is_none());
    }

    #[test]
    fn test_disable_query_removes_from_enabled() {
        let (_tmp, store) = open_store();
        let status_id = add_enabled_status(&store);
        let query_id = add_enabled_query(&store, status_id, 0);

        store.disable_query(query_id, Utc::now()).unwrap();

        let query = store.get_query(query_id).unwrap();
        assert!(query.enabled_at.is_none());
        assert!(query.failed_at.is_some());

        let statuses = store.get_enabled_statuses().unwrap();
        assert!(statuses[0].queries.is_empty());
    }

    #[test]
    fn test_downtime_escalation_sequence() {
        let (_tmp, store) = open_store();
        let status_id = add_enabled_status(&store);

        // Start from an online observation.
        let state = store
            .record_online(status_id, Utc::now(), &online_info())
            .unwrap();
        assert_eq!(state, DowntimeState::PendingDowntime);

        // Two offline rows still see the recent online row.
        let state = store.record_offline(status_id, Utc::now()).unwrap();
        assert_eq!(state, DowntimeState::Online);
        let state = store.record_offline(status_id, Utc::now()).unwrap();
        assert_eq!(state, DowntimeState::Online);

        // Third consecutive offline escalates into downtime.
        let state = store.record_offline(status_id, Utc::now()).unwrap();
        assert_eq!(state, DowntimeState::PendingDowntime);

        // Further offline rows stay in downtime without re-escalating.
        let state = store.record_offline(status_id, Utc::now()).unwrap();
        assert_eq!(state, DowntimeState::Downtime);

        let history = store.recent_history(status_id, 2).unwrap();
        assert!(history.iter().all(|row| row.down && !row.online));

        // Recovery observes the downtime it is ending.
        let state = store
            .record_online(status_id, Utc::now(), &online_info())
            .unwrap();
        assert_eq!(state, DowntimeState::Downtime);
        assert!(!store.recent_history(status_id, 1).unwrap()[0].down);
    }

    #[test]
    fn test_record_online_caches_fields_and_roster() {
        let (_tmp, store) = open_store();
        let status_id = add_enabled_status(&store);

        store
            .record_online(status_id, Utc::now(), &online_info())
            .unwrap();

        let status = store.get_status(status_id).unwrap();
        assert_eq!(status.title.as_deref(), Some("Server"));
        assert_eq!(status.map.as_deref(), Some("Altis"));

        // Empty player names are skipped.
        let history = store.recent_history(status_id, 1).unwrap();
        let players = store.history_players(history[0].status_history_id).unwrap();
        assert_eq!(players, vec!["Alice".to_string(), "Bob".to_string()]);

        // Absent fields keep their previous values.
        let mut partial = online_info();
        partial.map = None;
        partial.title = None;
        store.record_online(status_id, Utc::now(), &partial).unwrap();

        let status = store.get_status(status_id).unwrap();
        assert_eq!(status.title.as_deref(), Some("Server"));
        assert_eq!(status.map.as_deref(), Some("Altis"));
    }

    #[test]
    fn test_prune_history_windows() {
        let (_tmp, store) = open_store();
        let status_id = add_enabled_status(&store);
        let now = Utc::now();

        // One row past the long window, one past only the roster window.
        store
            .record_online(status_id, now - Duration::days(40), &online_info())
            .unwrap();
        store
            .record_online(status_id, now - Duration::hours(2), &online_info())
            .unwrap();
        store.record_online(status_id, now, &online_info()).unwrap();

        store
            .prune_history(status_id, now, Duration::days(30), Duration::hours(1))
            .unwrap();

        let history = store.recent_history(status_id, 10).unwrap();
        assert_eq!(history.len(), 2);

        // The stale row's roster is gone even though the row remains.
        let stale = &history[1];
        assert!(store.history_players(stale.status_history_id).unwrap().is_empty());
        let fresh = &history[0];
        assert_eq!(store.history_players(fresh.status_history_id).unwrap().len(), 2);
    }

    #[test]
    fn test_settings() {
        let (_tmp, store) = open_store();
        assert!(store.get_setting("query-interval").unwrap().is_none());
        store.set_setting("query-interval", "120").unwrap();
        assert_eq!(
            store.get_setting("query-interval").unwrap().as_deref(),
            Some("120")
        );
        store.set_setting("query-interval", "90").unwrap();
        assert_eq!(
            store.get_setting("query-interval").unwrap().as_deref(),
            Some("90")
        );
    }
}
