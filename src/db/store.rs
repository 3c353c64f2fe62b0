//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;
use super::{DowntimeIndex, EventLog};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const EVENT_COLUMNS: &str =
    "target_name, target_url, time, status_code, response_time_ms, response_preview, error_message";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Unreadable timestamp in store: {0}")]
    Time(String),
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

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Schema(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Retention ---

    /// Drop events past their horizon. Downtime rows are never expired.
    pub fn purge_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<PurgeStats, DbError> {
        let conn = self.conn();
        let expired = conn.execute(
            "DELETE FROM events WHERE time < ?1",
            params![format_db_time(now - policy.event_horizon)],
        )?;
        let expired_healthy = conn.execute(
            "DELETE FROM events WHERE status_code = 200 AND time < ?1",
            params![format_db_time(now - policy.healthy_horizon)],
        )?;
        Ok(PurgeStats {
            expired,
            expired_healthy,
        })
    }

    /// Total number of stored events.
    pub fn event_count(&self) -> Result<i64, DbError> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?)
    }
}

impl EventLog for Store {
    fn append(&self, event: &Event) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO events (target_name, target_url, time, status_code, response_time_ms, response_preview, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.target_name,
                event.target_url,
                format_db_time(event.timestamp),
                event.status_code(),
                event.response_time_ms,
                event.response_preview(),
                event.error_message(),
            ],
        )?;
        Ok(())
    }

    fn query_recent(&self, target_name: &str, limit: usize) -> Result<Vec<Event>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE target_name = ?1 ORDER BY time DESC, id DESC LIMIT ?2"
        ))?;

        let rows = stmt
            .query_map(params![target_name, limit as i64], EventRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    fn query_grouped_recent(
        &self,
        limit_per_target: usize,
    ) -> Result<HashMap<String, Vec<Event>>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM (
                 SELECT *, ROW_NUMBER() OVER (
                     PARTITION BY target_name ORDER BY time DESC, id DESC
                 ) AS rn
                 FROM events
             )
             WHERE rn <= ?1
             ORDER BY target_name, rn"
        ))?;

        let rows = stmt
            .query_map(params![limit_per_target as i64], EventRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut groups: HashMap<String, Vec<Event>> = HashMap::new();
        for row in rows {
            let event = row.into_event()?;
            groups
                .entry(event.target_name.clone())
                .or_default()
                .push(event);
        }
        Ok(groups)
    }

    fn find_latest(
        &self,
        target_name: &str,
        filter: EventFilter,
    ) -> Result<Option<Event>, DbError> {
        let predicate = match filter {
            EventFilter::Any => "",
            EventFilter::Failed => "AND status_code = 0",
            EventFilter::Succeeded => "AND status_code <> 0",
        };

        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE target_name = ?1 {predicate}
                     ORDER BY time DESC, id DESC LIMIT 1"
                ),
                params![target_name],
                EventRow::from_row,
            )
            .optional()?;

        row.map(EventRow::into_event).transpose()
    }
}

impl DowntimeIndex for Store {
    fn record_failure(&self, target_name: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO downtimes (target_name, time) VALUES (?1, ?2)
             ON CONFLICT(target_name) DO UPDATE SET time = excluded.time
             WHERE excluded.time > downtimes.time",
            params![target_name, format_db_time(at)],
        )?;
        Ok(())
    }

    fn get_last_downtime(&self, target_name: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn();
        let time: Option<String> = conn
            .query_row(
                "SELECT time FROM downtimes WHERE target_name = ?1",
                params![target_name],
                |row| row.get(0),
            )
            .optional()?;

        time.map(|s| parse_db_time(&s)).transpose()
    }

    fn get_all_last_downtimes(&self) -> Result<HashMap<String, DateTime<Utc>>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT target_name, time FROM downtimes")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(name, time)| parse_db_time(&time).map(|t| (name, t)))
            .collect()
    }
}

/// Raw columns of one `events` row.
struct EventRow {
    target_name: String,
    target_url: String,
    time: String,
    status_code: u16,
    response_time_ms: i64,
    response_preview: Option<String>,
    error_message: Option<String>,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            target_name: row.get(0)?,
            target_url: row.get(1)?,
            time: row.get(2)?,
            status_code: row.get(3)?,
            response_time_ms: row.get(4)?,
            response_preview: row.get(5)?,
            error_message: row.get(6)?,
        })
    }

    fn into_event(self) -> Result<Event, DbError> {
        let outcome = if self.status_code == FAILED_STATUS {
            ProbeOutcome::Failed {
                error: self.error_message.unwrap_or_default(),
            }
        } else {
            ProbeOutcome::Response {
                status_code: self.status_code,
                preview: self.response_preview.unwrap_or_default(),
            }
        };

        Ok(Event {
            timestamp: parse_db_time(&self.time)?,
            target_name: self.target_name,
            target_url: self.target_url,
            response_time_ms: self.response_time_ms,
            outcome,
        })
    }
}

/// Fixed-width UTC text, so string order matches time order.
fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn parse_db_time(s: &str) -> Result<DateTime<Utc>, DbError> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        .map_err(|_| DbError::Time(s.to_string()))
}
