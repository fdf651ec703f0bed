//! Scheduler module: decides when each (target, region) pair is probed,
//! dispatches probes with bounded per-region concurrency, and persists the
//! results through a batching writer.

mod retention;

pub use retention::*;

use crate::aggregate::LiveBuckets;
use crate::config::EngineConfig;
use crate::db::{DbError, NewTick, Store, Target};
use crate::probe::run_probe;
use crate::status::StatusTracker;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};

/// One dispatchable probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub target_id: i64,
    pub region_id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
struct PairSchedule {
    url: String,
    next_due: DateTime<Utc>,
}

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    store: Arc<Store>,
    cfg: EngineConfig,
    pairs: RwLock<BTreeMap<(i64, String), PairSchedule>>,
    region_limits: HashMap<String, Arc<Semaphore>>,
    tick_tx: mpsc::Sender<NewTick>,
    client: reqwest::Client,
    stop: broadcast::Sender<()>,
}

impl Scheduler {
    /// Create a new scheduler; spawns the batch writer that persists probe
    /// results and feeds them to the state machine and the live aggregator.
    pub fn new(
        store: Arc<Store>,
        tracker: Arc<StatusTracker>,
        live: Arc<LiveBuckets>,
        cfg: EngineConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        let (stop, _) = broadcast::channel(1);

        let region_limits = cfg
            .regions
            .iter()
            .map(|r| {
                (
                    r.clone(),
                    Arc::new(Semaphore::new(cfg.max_probes_per_region)),
                )
            })
            .collect();

        tokio::spawn(run_batch_writer(rx, store.clone(), tracker, live));

        Self {
            store,
            cfg,
            pairs: RwLock::new(BTreeMap::new()),
            region_limits,
            tick_tx: tx,
            client: reqwest::Client::new(),
            stop,
        }
    }

    /// Load the live target set and begin dispatching.
    pub async fn start(self: Arc<Self>) -> Result<(), DbError> {
        self.refresh_membership().await?;
        {
            let pairs = self.pairs.read().await;
            tracing::info!("Starting scheduler with {} pairs", pairs.len());
        }

        tokio::spawn(async move {
            self.run().await;
        });
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop.subscribe();
        let mut dispatch_interval = tokio::time::interval(Duration::from_secs(1));
        dispatch_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut refresh_interval = tokio::time::interval(self.cfg.membership_refresh);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = refresh_interval.tick() => {
                    if let Err(e) = self.refresh_membership().await {
                        tracing::error!("Scheduler: membership refresh failed: {}", e);
                    }
                }
                _ = dispatch_interval.tick() => {
                    self.dispatch_due(Utc::now()).await;
                }
            }
        }
    }

    /// Dispatch every due pair, in deterministic order. Each pair is
    /// rescheduled from its actual probe start, after the per-region
    /// semaphore is acquired, so backpressure delay never compresses the
    /// gap between consecutive probes.
    async fn dispatch_due(&self, now: DateTime<Utc>) {
        let due = {
            let pairs = self.pairs.read().await;
            due_dispatches(&pairs, now)
        };

        for dispatch in due {
            let semaphore = match self.region_limits.get(&dispatch.region_id) {
                Some(s) => s.clone(),
                None => continue,
            };
            let permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => continue,
            };

            let started = Utc::now();
            let next_due = started
                + ChronoDuration::from_std(self.cfg.probe_interval)
                    .unwrap_or_else(|_| ChronoDuration::seconds(30))
                + ChronoDuration::milliseconds(self.jitter_ms() as i64);
            {
                let mut pairs = self.pairs.write().await;
                match pairs.get_mut(&(dispatch.target_id, dispatch.region_id.clone())) {
                    Some(p) => p.next_due = next_due,
                    None => continue, // removed since the due scan
                }
            }

            let client = self.client.clone();
            let tx = self.tick_tx.clone();
            let timeout = self.cfg.probe_timeout;

            tokio::spawn(async move {
                let _permit = permit; // held for the duration of the probe

                let outcome = run_probe(&client, &dispatch.url, timeout).await;

                let tick = NewTick {
                    target_id: dispatch.target_id,
                    region_id: dispatch.region_id,
                    status: outcome.status,
                    response_time_ms: outcome.response_time_ms,
                    error_detail: outcome.error_detail,
                    dedup_key: None,
                    created_at: started,
                };

                if tx.send(tick).await.is_err() {
                    tracing::error!("Scheduler: result channel closed");
                }
            });
        }
    }

    /// Reconcile the pair set against the stored targets. Additions get an
    /// immediate (jitter-staggered) first probe; pairs for deleted targets
    /// are dropped. Runs on a short interval, so the view is eventually
    /// consistent and a freshly deleted target sees at most one stray probe.
    pub async fn refresh_membership(&self) -> Result<(), DbError> {
        let targets = self.store.get_targets()?;
        let now = Utc::now();

        let mut desired: HashSet<(i64, String)> = HashSet::new();
        let mut pairs = self.pairs.write().await;

        for target in &targets {
            for region in &self.cfg.regions {
                let key = (target.id, region.clone());
                desired.insert(key.clone());
                pairs.entry(key).or_insert_with(|| PairSchedule {
                    url: target.url.clone(),
                    next_due: now + ChronoDuration::milliseconds(self.jitter_ms() as i64),
                });
            }
        }

        pairs.retain(|key, _| desired.contains(key));
        Ok(())
    }

    /// Register a freshly created target without waiting for the next
    /// membership refresh.
    pub async fn add_target(&self, target: &Target) {
        let now = Utc::now();
        let mut pairs = self.pairs.write().await;
        for region in &self.cfg.regions {
            pairs
                .entry((target.id, region.clone()))
                .or_insert_with(|| PairSchedule {
                    url: target.url.clone(),
                    next_due: now + ChronoDuration::milliseconds(self.jitter_ms() as i64),
                });
        }
        tracing::info!("Scheduler: added target {} ({})", target.id, target.url);
    }

    /// Drop a deleted target's pairs. An already in-flight probe is not
    /// cancelled; its result is discarded at write time.
    pub async fn remove_target(&self, target_id: i64) {
        let mut pairs = self.pairs.write().await;
        pairs.retain(|(tid, _), _| *tid != target_id);
        tracing::info!("Scheduler: removed target {}", target_id);
    }

    fn jitter_ms(&self) -> u64 {
        if self.cfg.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.cfg.jitter_ms)
        }
    }
}

/// Due pairs sorted by (next_due, target_id, region_id): a fixed set of
/// due-times always yields the same dispatch sequence.
fn due_dispatches(
    pairs: &BTreeMap<(i64, String), PairSchedule>,
    now: DateTime<Utc>,
) -> Vec<Dispatch> {
    let mut due: Vec<(DateTime<Utc>, Dispatch)> = pairs
        .iter()
        .filter(|(_, p)| p.next_due <= now)
        .map(|((target_id, region_id), p)| {
            (
                p.next_due,
                Dispatch {
                    target_id: *target_id,
                    region_id: region_id.clone(),
                    url: p.url.clone(),
                },
            )
        })
        .collect();

    due.sort_by(|a, b| {
        (a.0, a.1.target_id, &a.1.region_id).cmp(&(b.0, b.1.target_id, &b.1.region_id))
    });
    due.into_iter().map(|(_, d)| d).collect()
}

/// Run the batch writer: accumulate probe results and flush them to the
/// store, then feed each persisted tick to the state machine and the live
/// aggregator.
async fn run_batch_writer(
    mut rx: mpsc::Receiver<NewTick>,
    store: Arc<Store>,
    tracker: Arc<StatusTracker>,
    live: Arc<LiveBuckets>,
) {
    let mut buffer: Vec<NewTick> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(t) => {
                        buffer.push(t);
                        if buffer.len() >= 100 {
                            flush_buffer(&store, &tracker, &live, &mut buffer).await;
                        }
                    }
                    None => {
                        flush_buffer(&store, &tracker, &live, &mut buffer).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &tracker, &live, &mut buffer).await;
            }
        }
    }
}

/// Flush buffered results. Results for targets deleted mid-flight are
/// discarded; store failures are retried with backoff and the batch is
/// dropped (and logged) if the store stays unavailable, so one bad flush
/// never stalls scheduling.
async fn flush_buffer(
    store: &Store,
    tracker: &StatusTracker,
    live: &LiveBuckets,
    buffer: &mut Vec<NewTick>,
) {
    if buffer.is_empty() {
        return;
    }

    buffer.retain(|t| store.target_exists(t.target_id).unwrap_or(true));
    if buffer.is_empty() {
        return;
    }

    let mut written = None;
    for attempt in 1u64..=3 {
        match store.append_ticks(buffer) {
            Ok(w) => {
                written = Some(w);
                break;
            }
            Err(e) => {
                tracing::warn!("tick flush attempt {} failed: {}", attempt, e);
                tokio::time::sleep(Duration::from_millis(200 * attempt)).await;
            }
        }
    }

    let ticks = match written {
        Some(t) => t,
        None => {
            tracing::error!("dropping {} ticks after repeated store failures", buffer.len());
            buffer.clear();
            return;
        }
    };
    buffer.clear();

    for tick in &ticks {
        if let Err(e) = tracker.process_tick(tick) {
            tracing::error!(
                "state machine error for target {} ({}): {}",
                tick.target_id,
                tick.region_id,
                e
            );
        }
        live.ingest(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertDispatcher;
    use crate::db::{TickStatus, CurrentStatus};
    use tempfile::NamedTempFile;

    fn schedule(url: &str, next_due: DateTime<Utc>) -> PairSchedule {
        PairSchedule {
            url: url.to_string(),
            next_due,
        }
    }

    #[test]
    fn test_due_dispatch_order_is_deterministic() {
        let now = Utc::now();
        let earlier = now - ChronoDuration::seconds(10);

        let mut pairs = BTreeMap::new();
        // Same due time: ties break by target id, then region id.
        pairs.insert((2, "asia-1".to_string()), schedule("https://b", earlier));
        pairs.insert((1, "us-east-1".to_string()), schedule("https://a", earlier));
        pairs.insert((1, "asia-1".to_string()), schedule("https://a", earlier));
        // Earlier due time wins regardless of ids.
        pairs.insert(
            (9, "us-east-1".to_string()),
            schedule("https://c", earlier - ChronoDuration::seconds(5)),
        );
        // Not due yet.
        pairs.insert(
            (0, "us-east-1".to_string()),
            schedule("https://d", now + ChronoDuration::seconds(30)),
        );

        let order: Vec<(i64, String)> = due_dispatches(&pairs, now)
            .into_iter()
            .map(|d| (d.target_id, d.region_id))
            .collect();

        assert_eq!(
            order,
            vec![
                (9, "us-east-1".to_string()),
                (1, "asia-1".to_string()),
                (1, "us-east-1".to_string()),
                (2, "asia-1".to_string()),
            ]
        );

        // Same inputs, same sequence.
        let again: Vec<(i64, String)> = due_dispatches(&pairs, now)
            .into_iter()
            .map(|d| (d.target_id, d.region_id))
            .collect();
        assert_eq!(order, again);
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            regions: vec!["us-east-1".to_string(), "india-1".to_string()],
            jitter_ms: 0,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_membership_tracks_target_set() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let tracker = Arc::new(StatusTracker::new(
            store.clone(),
            AlertDispatcher::new(8),
            1,
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            tracker,
            Arc::new(LiveBuckets::new()),
            test_config(),
        );

        let a = store.add_target("https://a.example.com", "local").unwrap();
        let b = store.add_target("https://b.example.com", "local").unwrap();
        scheduler.refresh_membership().await.unwrap();
        assert_eq!(scheduler.pairs.read().await.len(), 4);

        store.delete_target(b.id).unwrap();
        scheduler.refresh_membership().await.unwrap();
        let pairs = scheduler.pairs.read().await;
        assert_eq!(pairs.len(), 2);
        assert!(pairs.keys().all(|(tid, _)| *tid == a.id));
    }

    #[tokio::test]
    async fn test_flush_discards_results_for_deleted_targets() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let tracker = StatusTracker::new(store.clone(), AlertDispatcher::new(8), 1);
        let live = LiveBuckets::new();

        let target = store.add_target("https://a.example.com", "local").unwrap();
        let now = Utc::now();
        let tick = |target_id| NewTick {
            target_id,
            region_id: "us-east-1".to_string(),
            status: TickStatus::Up,
            response_time_ms: 50,
            error_detail: None,
            dedup_key: None,
            created_at: now,
        };

        // One live target, one stray result for a target deleted mid-flight.
        let mut buffer = vec![tick(target.id), tick(9999)];
        flush_buffer(&store, &tracker, &live, &mut buffer).await;

        assert!(buffer.is_empty());
        let kept = store
            .ticks_in_range(
                target.id,
                None,
                now - ChronoDuration::minutes(1),
                now + ChronoDuration::minutes(1),
            )
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert!(store
            .ticks_in_range(
                9999,
                None,
                now - ChronoDuration::minutes(1),
                now + ChronoDuration::minutes(1),
            )
            .unwrap()
            .is_empty());
        // The persisted tick reached the state machine and the live aggregator.
        assert_eq!(
            tracker.snapshot(target.id, "us-east-1").current_status,
            CurrentStatus::Up
        );
        let buckets = live
            .graph(
                target.id,
                ChronoDuration::seconds(60),
                now,
                now + ChronoDuration::minutes(1),
            )
            .unwrap();
        assert_eq!(buckets.iter().map(|b| b.up_count).sum::<i64>(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_anchors_to_probe_start() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let tracker = Arc::new(StatusTracker::new(
            store.clone(),
            AlertDispatcher::new(8),
            1,
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            tracker,
            Arc::new(LiveBuckets::new()),
            test_config(),
        );

        // A pair that has been due for a while, dispatched from a stale
        // round timestamp as happens when dispatch rounds lag.
        let stale_now = Utc::now() - ChronoDuration::seconds(30);
        scheduler.pairs.write().await.insert(
            (1, "us-east-1".to_string()),
            schedule("http://127.0.0.1:9", stale_now - ChronoDuration::seconds(60)),
        );

        let before = Utc::now();
        scheduler.dispatch_due(stale_now).await;

        let pairs = scheduler.pairs.read().await;
        let next_due = pairs
            .get(&(1, "us-east-1".to_string()))
            .unwrap()
            .next_due;
        // Anchored to the actual probe start, never the stale round time.
        let interval = ChronoDuration::from_std(scheduler.cfg.probe_interval).unwrap();
        assert!(next_due >= before + interval);
    }
}
