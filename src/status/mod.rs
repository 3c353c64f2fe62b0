//! Read-side aggregation of the event log into per-target status.

mod cache;

pub use cache::*;

use crate::db::{DbError, Event, StatusStore};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Aggregated answer keyed by target name.
pub type StatusMap = HashMap<String, AggregatedStatus>;

/// One point of a target's latency history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    /// Zero for failed probes, whatever was measured.
    pub response_time_ms: i64,
}

/// Display-ready status of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStatus {
    pub last_downtime: Option<DateTime<Utc>>,
    pub is_online: bool,
    /// Newest first.
    pub history: Vec<HistoryPoint>,
    pub url: String,
}

impl AggregatedStatus {
    /// Build from a non-empty, newest-first event window.
    fn from_window(events: &[Event], last_downtime: Option<DateTime<Utc>>) -> Option<Self> {
        let newest = events.first()?;

        let history = events
            .iter()
            .map(|e| HistoryPoint {
                timestamp: e.timestamp,
                response_time_ms: if e.is_failure() { 0 } else { e.response_time_ms },
            })
            .collect();

        Some(Self {
            last_downtime,
            is_online: !newest.is_failure(),
            history,
            url: newest.target_url.clone(),
        })
    }
}

/// Computes the status of every target that has ever been probed.
pub struct Aggregator {
    store: Arc<dyn StatusStore>,
    history_size: usize,
}

impl Aggregator {
    pub fn new(store: Arc<dyn StatusStore>, history_size: usize) -> Self {
        Self {
            store,
            history_size,
        }
    }

    /// Status of all targets, or an empty map if the store could not be read.
    /// Never a partial answer.
    pub fn compute_all(&self) -> StatusMap {
        match self.try_compute_all() {
            Ok(map) => map,
            Err(e) => {
                tracing::error!("Aggregator: failed to read store: {}", e);
                StatusMap::new()
            }
        }
    }

    pub fn try_compute_all(&self) -> Result<StatusMap, DbError> {
        let groups = self.store.query_grouped_recent(self.history_size)?;
        let downtimes = self.store.get_all_last_downtimes()?;

        Ok(groups
            .into_iter()
            .filter_map(|(name, events)| {
                let last_downtime = downtimes.get(&name).copied();
                AggregatedStatus::from_window(&events, last_downtime).map(|s| (name, s))
            })
            .collect())
    }
}
