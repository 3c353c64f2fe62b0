//! HTTP request handlers.

use super::AppState;
use crate::db::{Event, EventLog};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw events returned per target by the recent-status view.
pub const RECENT_EVENTS_PER_TARGET: usize = 30;

pub async fn handle_index() -> &'static str {
    "is-server-down is running"
}

/// Aggregated status of every probed target. Always 200; `{}` means the
/// status is temporarily unknown.
pub async fn handle_server_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.get().await)
}

// ============================================================================
// API: Raw recent events
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEvent {
    pub target_name: String,
    pub target_url: String,
    pub timestamp: DateTime<Utc>,
    pub status_code: u16,
    pub response_time_ms: i64,
    pub response_preview: Option<String>,
    pub error_message: Option<String>,
}

impl From<Event> for ApiEvent {
    fn from(e: Event) -> Self {
        Self {
            status_code: e.status_code(),
            response_preview: e.response_preview().map(String::from),
            error_message: e.error_message().map(String::from),
            target_name: e.target_name,
            target_url: e.target_url,
            timestamp: e.timestamp,
            response_time_ms: e.response_time_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecentStatusResponse {
    pub data: HashMap<String, Vec<ApiEvent>>,
}

#[derive(Debug, Deserialize)]
pub struct RecentStatusQuery {
    /// Restrict the view to one target.
    #[serde(default)]
    pub target: Option<String>,
}

pub async fn handle_recent_status(
    State(state): State<AppState>,
    Query(query): Query<RecentStatusQuery>,
) -> impl IntoResponse {
    let groups = match query.target {
        Some(name) => state
            .store
            .query_recent(&name, RECENT_EVENTS_PER_TARGET)
            .map(|events| {
                let mut groups = HashMap::new();
                if !events.is_empty() {
                    groups.insert(name, events);
                }
                groups
            }),
        None => state.store.query_grouped_recent(RECENT_EVENTS_PER_TARGET),
    };

    match groups {
        Ok(groups) => {
            let data = groups
                .into_iter()
                .map(|(name, events)| (name, events.into_iter().map(ApiEvent::from).collect()))
                .collect();
            Json(RecentStatusResponse { data }).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
