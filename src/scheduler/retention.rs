//! Retention manager for expiring old events.

use crate::db::{RetentionPolicy, Store};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Manager for deleting events past their retention horizon.
pub struct RetentionManager {
    store: Arc<Store>,
    policy: RetentionPolicy,
    every: Duration,
    stop: broadcast::Sender<()>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, policy: RetentionPolicy, every: Duration) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            policy,
            every,
            stop,
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let policy = self.policy;
        let mut rx = self.stop.subscribe();
        let mut interval = tokio::time::interval(self.every);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, &policy);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

fn process_retention(store: &Store, policy: &RetentionPolicy) {
    match store.purge_expired(Utc::now(), policy) {
        Ok(stats) if stats.expired + stats.expired_healthy > 0 => tracing::info!(
            "RetentionManager: Expired {} events past {} days, {} healthy events past {} days ({} left)",
            stats.expired,
            policy.event_horizon.num_days(),
            stats.expired_healthy,
            policy.healthy_horizon.num_days(),
            store.event_count().unwrap_or(-1)
        ),
        Ok(_) => {}
        Err(e) => tracing::error!("RetentionManager: Failed to expire events: {}", e),
    }
}
