//! SQLite tick store implementation.
//!
//! `append_ticks` is the only write path for probe outcomes; everything the
//! dashboard shows is derived from indexed range scans over the tick log.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

const TICK_COLS: &str = "id, target_id, region_id, status, response_time_ms, error_detail, created_at";

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

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Targets ---

    /// Add a new target.
    pub fn add_target(&self, url: &str, owner_id: &str) -> Result<Target, DbError> {
        let created_at = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO targets (url, owner_id, created_at) VALUES (?1, ?2, ?3)",
            params![url, owner_id, fmt_time(created_at)],
        )?;
        Ok(Target {
            id: conn.last_insert_rowid(),
            url: url.to_string(),
            owner_id: owner_id.to_string(),
            created_at,
        })
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, url, owner_id, created_at FROM targets WHERE id = ?1",
            params![id],
            row_to_target,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get all targets.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, url, owner_id, created_at FROM targets ORDER BY id")?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get all targets belonging to an owner.
    pub fn get_targets_for_owner(&self, owner_id: &str) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, url, owner_id, created_at FROM targets WHERE owner_id = ?1 ORDER BY id",
        )?;
        let targets = stmt
            .query_map(params![owner_id], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    pub fn target_exists(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM targets WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Delete a target, cascading to its ticks and incidents in one
    /// transaction. A missing target rolls the cascade back untouched.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM ticks WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM incidents WHERE target_id = ?1", params![id])?;
        let n = tx.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    // --- Ticks ---

    /// Append ticks in one transaction. Ticks carrying a `dedup_key` that was
    /// already seen are silently skipped; returns the ticks actually written,
    /// with their assigned IDs.
    pub fn append_ticks(&self, ticks: &[NewTick]) -> Result<Vec<Tick>, DbError> {
        if ticks.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut written = Vec::with_capacity(ticks.len());

        {
            let mut stmt = tx.prepare(
                "INSERT INTO ticks (target_id, region_id, status, response_time_ms, error_detail, dedup_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT DO NOTHING",
            )?;

            for t in ticks {
                let changed = stmt.execute(params![
                    t.target_id,
                    t.region_id,
                    t.status.to_db(),
                    t.response_time_ms,
                    t.error_detail,
                    t.dedup_key,
                    fmt_time(t.created_at),
                ])?;
                if changed == 0 {
                    continue; // duplicate delivery
                }
                written.push(Tick {
                    id: tx.last_insert_rowid(),
                    target_id: t.target_id,
                    region_id: t.region_id.clone(),
                    status: t.status,
                    response_time_ms: t.response_time_ms,
                    error_detail: t.error_detail.clone(),
                    created_at: t.created_at,
                });
            }
        }

        tx.commit()?;
        Ok(written)
    }

    /// Get ticks for a target within a time range, ascending by created_at.
    /// `region` of `None` means the union across all regions.
    pub fn ticks_in_range(
        &self,
        target_id: i64,
        region: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TICK_COLS} FROM ticks
             WHERE target_id = ?1 AND (?2 IS NULL OR region_id = ?2)
               AND created_at >= ?3 AND created_at < ?4
             ORDER BY created_at ASC, id ASC"
        ))?;
        let ticks = stmt
            .query_map(
                params![target_id, region, fmt_time(start), fmt_time(end)],
                row_to_tick,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(ticks)
    }

    /// Get the most recent ticks for a target, descending by created_at.
    pub fn recent_ticks(
        &self,
        target_id: i64,
        region: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Tick>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TICK_COLS} FROM ticks
             WHERE target_id = ?1 AND (?2 IS NULL OR region_id = ?2)
             ORDER BY created_at DESC, id DESC LIMIT ?3"
        ))?;
        let ticks = stmt
            .query_map(params![target_id, region, limit], row_to_tick)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(ticks)
    }

    /// Latest tick for a target, optionally restricted to one region.
    pub fn latest_tick(&self, target_id: i64, region: Option<&str>) -> Result<Option<Tick>, DbError> {
        let conn = self.conn.lock().unwrap();
        let tick = conn
            .query_row(
                &format!(
                    "SELECT {TICK_COLS} FROM ticks
                     WHERE target_id = ?1 AND (?2 IS NULL OR region_id = ?2)
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![target_id, region],
                row_to_tick,
            )
            .optional()?;
        Ok(tick)
    }

    /// Earliest tick ever recorded for a target (optionally one region).
    pub fn first_tick(&self, target_id: i64, region: Option<&str>) -> Result<Option<Tick>, DbError> {
        let conn = self.conn.lock().unwrap();
        let tick = conn
            .query_row(
                &format!(
                    "SELECT {TICK_COLS} FROM ticks
                     WHERE target_id = ?1 AND (?2 IS NULL OR region_id = ?2)
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                params![target_id, region],
                row_to_tick,
            )
            .optional()?;
        Ok(tick)
    }

    /// Latest tick whose status differs from `status` (streak boundary lookup).
    pub fn latest_tick_with_status_ne(
        &self,
        target_id: i64,
        region: Option<&str>,
        status: TickStatus,
    ) -> Result<Option<Tick>, DbError> {
        let conn = self.conn.lock().unwrap();
        let tick = conn
            .query_row(
                &format!(
                    "SELECT {TICK_COLS} FROM ticks
                     WHERE target_id = ?1 AND (?2 IS NULL OR region_id = ?2) AND status != ?3
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![target_id, region, status.to_db()],
                row_to_tick,
            )
            .optional()?;
        Ok(tick)
    }

    /// Earliest tick strictly after a point in time for one region.
    pub fn earliest_tick_after(
        &self,
        target_id: i64,
        region: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<Tick>, DbError> {
        let conn = self.conn.lock().unwrap();
        let tick = conn
            .query_row(
                &format!(
                    "SELECT {TICK_COLS} FROM ticks
                     WHERE target_id = ?1 AND region_id = ?2 AND created_at > ?3
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                params![target_id, region, fmt_time(after)],
                row_to_tick,
            )
            .optional()?;
        Ok(tick)
    }

    pub fn count_ticks_since(
        &self,
        target_id: i64,
        region: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ticks
             WHERE target_id = ?1 AND region_id = ?2 AND created_at >= ?3",
            params![target_id, region, fmt_time(since)],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Current streak in seconds across all regions: elapsed since the tick
    /// that began the current unbroken status run, or since the first tick
    /// ever if the status never changed. `None` before the first tick.
    pub fn current_streak_secs(
        &self,
        target_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, DbError> {
        let latest = match self.latest_tick(target_id, None)? {
            Some(t) => t,
            None => return Ok(None),
        };

        let streak_start = match self.latest_tick_with_status_ne(target_id, None, latest.status)? {
            Some(change) => {
                // First tick after the last differing one began the run.
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    &format!(
                        "SELECT {TICK_COLS} FROM ticks
                         WHERE target_id = ?1 AND created_at > ?2
                         ORDER BY created_at ASC, id ASC LIMIT 1"
                    ),
                    params![target_id, fmt_time(change.created_at)],
                    row_to_tick,
                )
                .optional()?
                .map(|t| t.created_at)
                .unwrap_or(latest.created_at)
            }
            None => match self.first_tick(target_id, None)? {
                Some(t) => t.created_at,
                None => return Ok(None),
            },
        };

        Ok(Some((now - streak_start).num_seconds()))
    }

    /// Delete ticks older than a cutoff. Never touches incidents.
    pub fn prune_ticks_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM ticks WHERE created_at < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Incidents ---

    /// Open an incident for a pair. Idempotent: if one is already open the
    /// existing incident is returned unchanged.
    pub fn open_incident(
        &self,
        target_id: i64,
        region_id: &str,
        opened_at: DateTime<Utc>,
        trigger_tick_id: i64,
    ) -> Result<Incident, DbError> {
        if let Some(open) = self.get_open_incident(target_id, region_id)? {
            return Ok(open);
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO incidents (target_id, region_id, opened_at, trigger_tick_id) VALUES (?1, ?2, ?3, ?4)",
            params![target_id, region_id, fmt_time(opened_at), trigger_tick_id],
        )?;
        Ok(Incident {
            id: conn.last_insert_rowid(),
            target_id,
            region_id: region_id.to_string(),
            opened_at,
            closed_at: None,
            trigger_tick_id,
            resolve_tick_id: None,
        })
    }

    /// The open incident for a pair, if any. At most one exists.
    pub fn get_open_incident(
        &self,
        target_id: i64,
        region_id: &str,
    ) -> Result<Option<Incident>, DbError> {
        let conn = self.conn.lock().unwrap();
        let incident = conn
            .query_row(
                "SELECT id, target_id, region_id, opened_at, closed_at, trigger_tick_id, resolve_tick_id
                 FROM incidents
                 WHERE target_id = ?1 AND region_id = ?2 AND closed_at IS NULL
                 ORDER BY opened_at DESC LIMIT 1",
                params![target_id, region_id],
                row_to_incident,
            )
            .optional()?;
        Ok(incident)
    }

    pub fn count_open_incidents(&self, target_id: i64, region_id: &str) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents
             WHERE target_id = ?1 AND region_id = ?2 AND closed_at IS NULL",
            params![target_id, region_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Close an incident. Returns false if it was already closed (no-op).
    pub fn close_incident(
        &self,
        incident_id: i64,
        closed_at: DateTime<Utc>,
        resolve_tick_id: i64,
    ) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE incidents SET closed_at = ?1, resolve_tick_id = ?2
             WHERE id = ?3 AND closed_at IS NULL",
            params![fmt_time(closed_at), resolve_tick_id, incident_id],
        )?;
        Ok(n > 0)
    }

    /// Number of incidents whose opened_at falls inside the window.
    pub fn count_incidents_opened_in(
        &self,
        target_id: i64,
        region: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents
             WHERE target_id = ?1 AND (?2 IS NULL OR region_id = ?2)
               AND opened_at >= ?3 AND opened_at < ?4",
            params![target_id, region, fmt_time(start), fmt_time(end)],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_target(row: &Row<'_>) -> SqlResult<Target> {
    let created: String = row.get(3)?;
    Ok(Target {
        id: row.get(0)?,
        url: row.get(1)?,
        owner_id: row.get(2)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

fn row_to_tick(row: &Row<'_>) -> SqlResult<Tick> {
    let created: String = row.get(6)?;
    Ok(Tick {
        id: row.get(0)?,
        target_id: row.get(1)?,
        region_id: row.get(2)?,
        status: TickStatus::from_db(row.get(3)?),
        response_time_ms: row.get(4)?,
        error_detail: row.get(5)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

fn row_to_incident(row: &Row<'_>) -> SqlResult<Incident> {
    let opened: String = row.get(3)?;
    let closed: Option<String> = row.get(4)?;
    Ok(Incident {
        id: row.get(0)?,
        target_id: row.get(1)?,
        region_id: row.get(2)?,
        opened_at: parse_db_time(&opened).unwrap_or_else(Utc::now),
        closed_at: closed.as_deref().and_then(parse_db_time),
        trigger_tick_id: row.get(5)?,
        resolve_tick_id: row.get(6)?,
    })
}

/// Fixed-width UTC text encoding; lexicographic order matches time order.
fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
