//! Aggregation engine: rolling window stats and fixed-width buckets.
//!
//! Everything here is a pure function over tick slices, so the derived
//! figures are always recomputable from the raw log. `BucketBuilder` is the
//! single-pass incremental form; `build_buckets` is the batch definition the
//! incremental path must reproduce exactly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use crate::db::{Bucket, Tick, TickStatus};

/// Rolling stats over a window. Produced only for windows that contain at
/// least one tick; an empty window is "insufficient data", never 100%.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub uptime_pct: f64,
    pub up_count: i64,
    pub down_count: i64,
    /// Mean latency over up ticks; down ticks carry no meaningful latency.
    pub avg_response_time_ms: Option<i64>,
    pub incidents_count: i64,
}

/// Compute stats for a window of ticks. `incidents_count` is the number of
/// incidents opened inside the same window, counted by the caller.
pub fn window_stats(ticks: &[Tick], incidents_count: i64) -> Option<WindowStats> {
    if ticks.is_empty() {
        return None;
    }

    let mut up_count = 0i64;
    let mut down_count = 0i64;
    let mut up_latency_sum = 0i64;

    for tick in ticks {
        match tick.status {
            TickStatus::Up => {
                up_count += 1;
                up_latency_sum += tick.response_time_ms;
            }
            TickStatus::Down => down_count += 1,
        }
    }

    let total = up_count + down_count;
    let avg_response_time_ms = if up_count > 0 {
        Some((up_latency_sum as f64 / up_count as f64).round() as i64)
    } else {
        None
    };

    Some(WindowStats {
        uptime_pct: 100.0 * up_count as f64 / total as f64,
        up_count,
        down_count,
        avg_response_time_ms,
        incidents_count,
    })
}

/// Bucket width scales with the window: 1-minute buckets up to a day,
/// 1-hour up to a week, 4-hour beyond.
pub fn bucket_width_for(window: ChronoDuration) -> ChronoDuration {
    if window <= ChronoDuration::days(1) {
        ChronoDuration::seconds(60)
    } else if window <= ChronoDuration::days(7) {
        ChronoDuration::hours(1)
    } else {
        ChronoDuration::hours(4)
    }
}

/// Truncate a datetime to the start of its containing bucket.
pub fn truncate_to_bucket(dt: DateTime<Utc>, width: ChronoDuration) -> DateTime<Utc> {
    let width_secs = width.num_seconds().max(1);
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(width_secs);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

#[derive(Debug, Clone, Default)]
struct BucketAcc {
    up_count: i64,
    down_count: i64,
    up_latency_sum: i64,
}

impl BucketAcc {
    fn add(&mut self, tick: &Tick) {
        match tick.status {
            TickStatus::Up => {
                self.up_count += 1;
                self.up_latency_sum += tick.response_time_ms;
            }
            TickStatus::Down => self.down_count += 1,
        }
    }

    /// A bucket containing any down tick reads as down (zero latency) so a
    /// single failure dominates the chart signal.
    fn finalize(&self, bucket_start_secs: i64) -> Bucket {
        let avg = if self.down_count > 0 || self.up_count == 0 {
            0
        } else {
            (self.up_latency_sum as f64 / self.up_count as f64).round() as i64
        };
        Bucket {
            bucket_start: DateTime::from_timestamp(bucket_start_secs, 0)
                .unwrap_or_else(|| Utc::now()),
            avg_response_time_ms: avg,
            up_count: self.up_count,
            down_count: self.down_count,
        }
    }
}

/// Batch bucketing: one bucket per non-empty slot, ascending. This is the
/// definitional fallback path over raw ticks.
pub fn build_buckets(ticks: &[Tick], width: ChronoDuration) -> Vec<Bucket> {
    let width_secs = width.num_seconds().max(1);
    let mut slots: BTreeMap<i64, BucketAcc> = BTreeMap::new();

    for tick in ticks {
        let ts = tick.created_at.timestamp();
        let start = ts - ts.rem_euclid(width_secs);
        slots.entry(start).or_default().add(tick);
    }

    slots
        .iter()
        .map(|(start, acc)| acc.finalize(*start))
        .collect()
}

/// Incremental bucketing: ingests ticks one at a time, keeping running sums
/// for the open bucket and sealing it when a later bucket starts. Produces
/// exactly the same buckets as `build_buckets` for in-order input.
pub struct BucketBuilder {
    width_secs: i64,
    completed: Vec<Bucket>,
    open: Option<(i64, BucketAcc)>,
}

impl BucketBuilder {
    pub fn new(width: ChronoDuration) -> Self {
        Self {
            width_secs: width.num_seconds().max(1),
            completed: Vec::new(),
            open: None,
        }
    }

    pub fn ingest(&mut self, tick: &Tick) {
        let ts = tick.created_at.timestamp();
        let start = ts - ts.rem_euclid(self.width_secs);

        match &mut self.open {
            Some((open_start, acc)) if *open_start == start => acc.add(tick),
            Some((open_start, acc)) if *open_start < start => {
                self.completed.push(acc.finalize(*open_start));
                let mut acc = BucketAcc::default();
                acc.add(tick);
                self.open = Some((start, acc));
            }
            Some((_, acc)) => {
                // Late tick behind the open bucket; ticks arrive ordered from
                // the store, so fold it in rather than reopening history.
                acc.add(tick);
            }
            None => {
                let mut acc = BucketAcc::default();
                acc.add(tick);
                self.open = Some((start, acc));
            }
        }
    }

    /// Seal the open bucket and return all buckets, ascending.
    pub fn finish(mut self) -> Vec<Bucket> {
        if let Some((start, acc)) = self.open.take() {
            self.completed.push(acc.finalize(start));
        }
        self.completed
    }
}

/// Retained completed buckets per target; a bit over a day of minutes.
const MAX_LIVE_BUCKETS: usize = 1500;

#[derive(Default)]
struct TargetSeries {
    completed: VecDeque<Bucket>,
    open: Option<(i64, BucketAcc)>,
}

impl TargetSeries {
    fn ingest(&mut self, tick: &Tick, width_secs: i64) {
        let ts = tick.created_at.timestamp();
        let start = ts - ts.rem_euclid(width_secs);

        match &mut self.open {
            Some((open_start, acc)) if *open_start == start => acc.add(tick),
            Some((open_start, acc)) if *open_start < start => {
                self.completed.push_back(acc.finalize(*open_start));
                if self.completed.len() > MAX_LIVE_BUCKETS {
                    self.completed.pop_front();
                }
                let mut acc = BucketAcc::default();
                acc.add(tick);
                self.open = Some((start, acc));
            }
            Some((_, acc)) => acc.add(tick),
            None => {
                let mut acc = BucketAcc::default();
                acc.add(tick);
                self.open = Some((start, acc));
            }
        }
    }

    fn collect(&self, start: DateTime<Utc>, end: DateTime<Utc>, width_secs: i64) -> Vec<Bucket> {
        let width = ChronoDuration::seconds(width_secs);
        let overlaps =
            |b: &Bucket| b.bucket_start < end && b.bucket_start + width > start;

        let mut out: Vec<Bucket> = self
            .completed
            .iter()
            .filter(|b| overlaps(b))
            .cloned()
            .collect();
        if let Some((open_start, acc)) = &self.open {
            let sealed = acc.finalize(*open_start);
            if overlaps(&sealed) {
                out.push(sealed);
            }
        }
        out
    }
}

/// Live bucket series fed from the scheduler's result path, one per target
/// (union across regions) at the default one-minute width. Serves the
/// standard dashboard window without rescanning the tick log; windows it
/// does not cover come from the raw recompute instead.
pub struct LiveBuckets {
    width: ChronoDuration,
    since: DateTime<Utc>,
    series: Mutex<HashMap<i64, TargetSeries>>,
}

impl LiveBuckets {
    pub fn new() -> Self {
        Self {
            width: ChronoDuration::seconds(60),
            since: Utc::now(),
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn ingest(&self, tick: &Tick) {
        let mut series = self.series.lock().unwrap();
        series
            .entry(tick.target_id)
            .or_default()
            .ingest(tick, self.width.num_seconds());
    }

    /// Buckets for a window, or `None` when the window needs the raw
    /// recompute: a different width, or history predating this process.
    pub fn graph(
        &self,
        target_id: i64,
        width: ChronoDuration,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Vec<Bucket>> {
        if width != self.width || start < self.since {
            return None;
        }
        let series = self.series.lock().unwrap();
        Some(
            series
                .get(&target_id)
                .map(|s| s.collect(start, end, self.width.num_seconds()))
                .unwrap_or_default(),
        )
    }

    /// Drop all in-memory buckets for a deleted target.
    pub fn forget_target(&self, target_id: i64) {
        let mut series = self.series.lock().unwrap();
        series.remove(&target_id);
    }
}

impl Default for LiveBuckets {
    fn default() -> Self {
        Self::new()
    }
}
