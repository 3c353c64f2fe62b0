//! Short-lived cache in front of the aggregator.

use super::{Aggregator, StatusMap};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Cached {
    computed_at: Instant,
    status: StatusMap,
}

/// Collapses concurrent status requests into one aggregation per TTL window.
///
/// The check-and-refresh runs under a single lock, so callers arriving during
/// a refresh wait for it and then reuse its result. A zero TTL disables
/// reuse but keeps refreshes serialized.
pub struct ResultCache {
    aggregator: Arc<Aggregator>,
    ttl: Duration,
    state: Arc<Mutex<Option<Cached>>>,
}

impl ResultCache {
    pub fn new(aggregator: Arc<Aggregator>, ttl: Duration) -> Self {
        Self {
            aggregator,
            ttl,
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Cached status if still fresh, otherwise a new aggregation.
    pub async fn get(&self) -> StatusMap {
        let mut guard = self.state.clone().lock_owned().await;

        if let Some(cached) = guard.as_ref() {
            if cached.computed_at.elapsed() < self.ttl {
                return cached.status.clone();
            }
        }

        let aggregator = self.aggregator.clone();
        let ttl = self.ttl;

        // Owned by its own task: a caller that disconnects mid-refresh does
        // not abandon it, and the result still lands in the cache.
        let refresh = tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || aggregator.try_compute_all()).await;

            // A failed pass is cached as `{}` for the rest of its window.
            let status = match result {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    tracing::error!("ResultCache: aggregation failed: {}", e);
                    StatusMap::new()
                }
                Err(e) => {
                    tracing::error!("ResultCache: aggregation task failed: {}", e);
                    StatusMap::new()
                }
            };

            if !ttl.is_zero() {
                *guard = Some(Cached {
                    computed_at: Instant::now(),
                    status: status.clone(),
                });
            }
            status
        });

        refresh.await.unwrap_or_else(|e| {
            tracing::error!("ResultCache: refresh task failed: {}", e);
            StatusMap::new()
        })
    }
}
