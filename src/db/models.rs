//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single probe, as recorded in a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickStatus {
    Up,
    Down,
}

impl TickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickStatus::Up => "up",
            TickStatus::Down => "down",
        }
    }

    /// Storage encoding: 1 = up, 0 = down.
    pub fn to_db(self) -> i64 {
        match self {
            TickStatus::Up => 1,
            TickStatus::Down => 0,
        }
    }

    pub fn from_db(v: i64) -> Self {
        if v == 1 {
            TickStatus::Up
        } else {
            TickStatus::Down
        }
    }
}

/// A monitored endpoint, checked from every configured region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub url: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// A tick candidate produced by a probe, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewTick {
    pub target_id: i64,
    pub region_id: String,
    pub status: TickStatus,
    pub response_time_ms: i64,
    pub error_detail: Option<String>,
    /// Optional idempotency key for duplicate delivery; duplicates without
    /// one are accepted as distinct samples.
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One recorded probe outcome. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct Tick {
    pub id: i64,
    pub target_id: i64,
    pub region_id: String,
    pub status: TickStatus,
    pub response_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A bounded down-period for one (target, region) pair.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: i64,
    pub target_id: i64,
    pub region_id: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub trigger_tick_id: i64,
    pub resolve_tick_id: Option<i64>,
}

/// Current status of a (target, region) pair as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentStatus {
    Up,
    Down,
    /// No tick has ever been observed for the pair.
    Unknown,
}

/// Derived per-pair view; recomputable from ticks, never the source of truth.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub target_id: i64,
    pub region_id: String,
    pub current_status: CurrentStatus,
    pub streak_started_at: Option<DateTime<Utc>>,
}

/// A fixed-width aggregation window for charting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub bucket_start: DateTime<Utc>,
    pub avg_response_time_ms: i64,
    pub up_count: i64,
    pub down_count: i64,
}
