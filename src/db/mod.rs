//! Database module.
//!
//! The event log and downtime index are consumed through the [`EventLog`] and
//! [`DowntimeIndex`] traits; [`Store`] is the SQLite implementation of both.

mod models;
mod store;

pub use models::*;
pub use store::*;

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Append-only log of probe events.
pub trait EventLog: Send + Sync {
    /// Append one event.
    fn append(&self, event: &Event) -> Result<(), DbError>;

    /// Latest `limit` events for one target, newest first.
    fn query_recent(&self, target_name: &str, limit: usize) -> Result<Vec<Event>, DbError>;

    /// Latest `limit_per_target` events for every target, newest first within
    /// each group. Targets with no events are absent.
    fn query_grouped_recent(
        &self,
        limit_per_target: usize,
    ) -> Result<HashMap<String, Vec<Event>>, DbError>;

    /// Newest event for a target matching `filter`.
    fn find_latest(&self, target_name: &str, filter: EventFilter)
        -> Result<Option<Event>, DbError>;
}

/// Last failure time per target.
pub trait DowntimeIndex: Send + Sync {
    /// Upsert; the highest timestamp wins regardless of arrival order.
    fn record_failure(&self, target_name: &str, at: DateTime<Utc>) -> Result<(), DbError>;

    fn get_last_downtime(&self, target_name: &str) -> Result<Option<DateTime<Utc>>, DbError>;

    fn get_all_last_downtimes(&self) -> Result<HashMap<String, DateTime<Utc>>, DbError>;
}

/// Everything the scheduler writes to and the aggregator reads from.
pub trait StatusStore: EventLog + DowntimeIndex {}

impl<T: EventLog + DowntimeIndex> StatusStore for T {}

/// Append an event and, for failures, move the target's downtime marker.
pub fn record_event(store: &dyn StatusStore, event: &Event) -> Result<(), DbError> {
    store.append(event)?;
    if event.is_failure() {
        store.record_failure(&event.target_name, event.timestamp)?;
    }
    Ok(())
}
