//! Scheduler module for running probe ticks and recording their events.

mod retention;

pub use retention::*;

use crate::db::{record_event, Event, EventFilter, StatusStore};
use crate::probe::{probe_target, ProbeError, ProbeTarget};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;

/// Counts for one finished tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub probed: usize,
    pub failed: usize,
}

/// The main scheduler that fans probes out on every tick.
pub struct Scheduler {
    store: Arc<dyn StatusStore>,
    targets: Arc<Vec<ProbeTarget>>,
    client: reqwest::Client,
    interval: Duration,
    /// Shared by every tick so overlapping ticks still respect the cap.
    permits: Arc<Semaphore>,
    event_tx: mpsc::Sender<Event>,
    stop_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Create a new scheduler and start its event writer.
    pub fn new(
        store: Arc<dyn StatusStore>,
        targets: Vec<ProbeTarget>,
        interval: Duration,
        max_concurrent_probes: usize,
    ) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("is-server-down/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        let (tx, rx) = mpsc::channel(1000);

        // Start event writer in a separate task
        tokio::spawn(run_event_writer(rx, store.clone()));

        let (stop_tx, _) = broadcast::channel(1);

        Ok(Self {
            store,
            targets: Arc::new(targets),
            client,
            interval,
            permits: Arc::new(Semaphore::new(max_concurrent_probes.max(1))),
            event_tx: tx,
            stop_tx,
        })
    }

    /// Start ticking. Each tick runs in its own task so a slow tick never
    /// holds up the next one.
    pub fn start(&self) {
        tracing::info!(
            "Starting scheduler with {} targets every {:?}",
            self.targets.len(),
            self.interval
        );

        backfill_downtime_index(self.store.as_ref(), &self.targets);

        let targets = self.targets.clone();
        let client = self.client.clone();
        let permits = self.permits.clone();
        let tx = self.event_tx.clone();
        let interval = self.interval;
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        let tick = run_tick(
                            targets.clone(),
                            client.clone(),
                            permits.clone(),
                            tx.clone(),
                        );
                        tokio::spawn(async move {
                            let summary = tick.await;
                            tracing::debug!(
                                "Tick finished: {} probed, {} failed",
                                summary.probed,
                                summary.failed
                            );
                        });
                    }
                }
            }

            tracing::info!("Scheduler stopped");
        });
    }

    /// Stop issuing new ticks. Probes already in flight still finish.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Probe every target once, concurrently.
///
/// Each event is handed to the writer as soon as its own probe finishes, so a
/// slow target never delays the others. Returns once all probes are done.
pub async fn run_tick(
    targets: Arc<Vec<ProbeTarget>>,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    tx: mpsc::Sender<Event>,
) -> TickSummary {
    let mut probes = JoinSet::new();

    for target in targets.iter().cloned() {
        let permit = match permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break, // semaphore closed
        };

        let client = client.clone();
        let tx = tx.clone();

        probes.spawn(async move {
            let _permit = permit; // Hold permit until done

            let event = probe_target(&client, &target).await;
            let failed = event.is_failure();
            if failed {
                tracing::warn!(
                    "{} is unreachable: {}",
                    target.name,
                    event.error_message().unwrap_or_default()
                );
            }

            if tx.send(event).await.is_err() {
                tracing::error!("Failed to send result for {}", target.name);
            }
            failed
        });
    }

    let mut summary = TickSummary::default();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(failed) => {
                summary.probed += 1;
                if failed {
                    summary.failed += 1;
                }
            }
            Err(e) => tracing::error!("Probe task aborted: {}", e),
        }
    }
    summary
}

/// Write events as they arrive. A failed write drops that event; there is no
/// retry, the next tick produces a fresh one.
async fn run_event_writer(mut rx: mpsc::Receiver<Event>, store: Arc<dyn StatusStore>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = record_event(store.as_ref(), &event) {
            tracing::error!(
                "Failed to record event for {} at {}: {}",
                event.target_name,
                event.timestamp,
                e
            );
        }
    }
}

/// Rebuild missing downtime rows from the newest failed event in the log.
pub fn backfill_downtime_index(store: &dyn StatusStore, targets: &[ProbeTarget]) {
    for target in targets {
        match store.get_last_downtime(&target.name) {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Backfill: failed to read downtime for {}: {}", target.name, e);
                continue;
            }
        }

        match store.find_latest(&target.name, EventFilter::Failed) {
            Ok(Some(event)) => match store.record_failure(&target.name, event.timestamp) {
                Ok(()) => tracing::info!(
                    "Backfill: last downtime for {} is {}",
                    target.name,
                    event.timestamp
                ),
                Err(e) => tracing::error!("Backfill: failed to write downtime for {}: {}", target.name, e),
            },
            Ok(None) => {}
            Err(e) => tracing::error!("Backfill: failed to scan events for {}: {}", target.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DowntimeIndex, EventLog, ProbeOutcome, Store};
    use axum::{routing::get, Router};
    use chrono::{TimeZone, Utc};
    use reqwest::header::HeaderMap;
    use reqwest::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::NamedTempFile;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Accepts TCP connections and never answers.
    async fn black_hole() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}/", addr)
    }

    fn target(name: &str, url: &str, timeout: Duration) -> ProbeTarget {
        ProbeTarget {
            name: name.to_string(),
            url: url.parse().unwrap(),
            method: Method::GET,
            headers: HeaderMap::new(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_slow_target_does_not_delay_others() {
        let fast = serve(Router::new().route("/", get(|| async { "ok" }))).await;
        let slow = black_hole().await;

        let targets = Arc::new(vec![
            target("Slow", &slow, Duration::from_secs(1)),
            target("Fast", &format!("{}/", fast), Duration::from_secs(1)),
        ]);
        let (tx, mut rx) = mpsc::channel(10);

        let start = Instant::now();
        let tick = tokio::spawn(run_tick(
            targets,
            reqwest::Client::new(),
            Arc::new(Semaphore::new(4)),
            tx,
        ));

        let first = tokio::time::timeout(Duration::from_millis(800), rx.recv())
            .await
            .expect("fast target should report before the slow one times out")
            .unwrap();
        assert_eq!(first.target_name, "Fast");
        assert_eq!(first.status_code(), 200);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.target_name, "Slow");
        assert!(second.is_failure());

        let summary = tick.await.unwrap();
        assert_eq!(summary, TickSummary { probed: 2, failed: 1 });
        // Bounded by the single slowest timeout, not the sum.
        assert!(start.elapsed() < Duration::from_millis(1800));
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (f, p) = (in_flight.clone(), peak.clone());
        let handler = move || {
            let (f, p) = (f.clone(), p.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                "ok"
            }
        };
        let base = serve(Router::new().route("/", get(handler))).await;

        let targets = Arc::new(
            (0..4)
                .map(|i| target(&format!("T{}", i), &format!("{}/", base), Duration::from_secs(2)))
                .collect::<Vec<_>>(),
        );
        let (tx, mut rx) = mpsc::channel(10);

        let summary = run_tick(targets, reqwest::Client::new(), Arc::new(Semaphore::new(2)), tx).await;
        assert_eq!(summary, TickSummary { probed: 4, failed: 0 });
        assert!(peak.load(Ordering::SeqCst) <= 2);

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn test_writer_records_events_and_downtime() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let (tx, rx) = mpsc::channel(10);
        let writer = tokio::spawn(run_event_writer(rx, store.clone()));

        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 15).unwrap();
        tx.send(Event {
            target_name: "SSO".to_string(),
            target_url: "https://sso.example.ac.kr/".to_string(),
            timestamp: t1,
            response_time_ms: 3000,
            outcome: ProbeOutcome::Failed {
                error: "network error: connection refused".to_string(),
            },
        })
        .await
        .unwrap();
        tx.send(Event {
            target_name: "SSO".to_string(),
            target_url: "https://sso.example.ac.kr/".to_string(),
            timestamp: t2,
            response_time_ms: 80,
            outcome: ProbeOutcome::Response {
                status_code: 200,
                preview: "ok".to_string(),
            },
        })
        .await
        .unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(store.query_recent("SSO", 10).unwrap().len(), 2);
        // The success does not clear the downtime marker.
        assert_eq!(store.get_last_downtime("SSO").unwrap(), Some(t1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scheduler_runs_until_stopped() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());

        // Logged before the downtime table existed; start() must backfill it.
        let archived_failure = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap();
        store
            .append(&Event {
                target_name: "Archive".to_string(),
                target_url: "https://archive.example.ac.kr/".to_string(),
                timestamp: archived_failure,
                response_time_ms: 10_000,
                outcome: ProbeOutcome::Failed {
                    error: "probe timed out after 10s".to_string(),
                },
            })
            .unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        let handler = move || {
            let (f, p) = (f.clone(), p.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                "ok"
            }
        };
        let up = format!("{}/", serve(Router::new().route("/", get(handler))).await);
        let down = black_hole().await;

        let scheduler = Scheduler::new(
            store.clone(),
            vec![
                target("Up", &up, Duration::from_secs(1)),
                target("Archive", &up, Duration::from_secs(1)),
                target("Down", &down, Duration::from_millis(200)),
            ],
            Duration::from_millis(100),
            2,
        )
        .unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.stop();

        // Ticks already started still drain through the shared permits.
        let mut settled = store.event_count().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let now = store.event_count().unwrap();
            if now == settled || Instant::now() > deadline {
                break;
            }
            settled = now;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.event_count().unwrap(), settled, "ticks continued after stop");

        let up_events = store.query_recent("Up", 100).unwrap();
        assert!(!up_events.is_empty());
        assert!(up_events.iter().all(|e| e.status_code() == 200));

        let down_events = store.query_recent("Down", 100).unwrap();
        assert!(!down_events.is_empty());
        assert!(down_events.iter().all(|e| e.is_failure()));
        let newest_failure = down_events[0].timestamp;
        assert_eq!(store.get_last_downtime("Down").unwrap(), Some(newest_failure));

        assert_eq!(store.get_last_downtime("Archive").unwrap(), Some(archived_failure));
        assert_eq!(store.get_last_downtime("Up").unwrap(), None);

        // Overlapping ticks share one cap; per-tick permits would exceed it.
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_backfill_downtime_index() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let failed_at = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap();

        store
            .append(&Event {
                target_name: "KLMS".to_string(),
                target_url: "https://klms.example.ac.kr/".to_string(),
                timestamp: failed_at,
                response_time_ms: 10_000,
                outcome: ProbeOutcome::Failed {
                    error: "probe timed out after 10s".to_string(),
                },
            })
            .unwrap();

        let targets = vec![
            target("KLMS", "https://klms.example.ac.kr/", Duration::from_secs(1)),
            target("SSO", "https://sso.example.ac.kr/", Duration::from_secs(1)),
        ];
        backfill_downtime_index(&store, &targets);

        assert_eq!(store.get_last_downtime("KLMS").unwrap(), Some(failed_at));
        assert_eq!(store.get_last_downtime("SSO").unwrap(), None);
    }
}
