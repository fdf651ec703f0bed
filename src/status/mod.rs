//! Status & incident state machine.
//!
//! Per (target, region) pair: `UNKNOWN -> UP <-> DOWN`, driven by ticks in
//! strict created_at order. Pairs are independent; incidents open after the
//! configured number of consecutive failures and close on the first success.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::alert::AlertDispatcher;
use crate::db::{CurrentStatus, DbError, StatusSnapshot, Store, Tick, TickStatus};

#[derive(Debug, Clone)]
struct PairState {
    status: CurrentStatus,
    streak_started_at: Option<DateTime<Utc>>,
    last_tick_at: Option<DateTime<Utc>>,
    consecutive_downs: u32,
    /// First failing tick of the current down run. Armed only on an
    /// UP -> DOWN edge; a pair that has been down since its first-ever tick
    /// never opens an incident.
    pending_down: Option<(DateTime<Utc>, i64)>,
    open_incident_id: Option<i64>,
}

impl Default for PairState {
    fn default() -> Self {
        Self {
            status: CurrentStatus::Unknown,
            streak_started_at: None,
            last_tick_at: None,
            consecutive_downs: 0,
            pending_down: None,
            open_incident_id: None,
        }
    }
}

/// Tracks current status, streaks and open incidents for every pair.
pub struct StatusTracker {
    store: Arc<Store>,
    dispatcher: AlertDispatcher,
    debounce_ticks: u32,
    pairs: Mutex<HashMap<(i64, String), PairState>>,
}

impl StatusTracker {
    pub fn new(store: Arc<Store>, dispatcher: AlertDispatcher, debounce_ticks: u32) -> Self {
        Self {
            store,
            dispatcher,
            debounce_ticks: debounce_ticks.max(1),
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one persisted tick. Ticks at or before the pair's last
    /// processed timestamp are rejected, so replay and late arrivals can
    /// never reopen history.
    pub fn process_tick(&self, tick: &Tick) -> Result<(), DbError> {
        let mut pairs = self.pairs.lock().unwrap();
        let state = pairs
            .entry((tick.target_id, tick.region_id.clone()))
            .or_default();

        if let Some(last) = state.last_tick_at {
            if tick.created_at <= last {
                tracing::debug!(
                    target_id = tick.target_id,
                    region = %tick.region_id,
                    "rejecting stale tick at {}",
                    tick.created_at
                );
                return Ok(());
            }
        }

        match (state.status, tick.status) {
            (CurrentStatus::Unknown, TickStatus::Up) => {
                state.status = CurrentStatus::Up;
                state.streak_started_at = Some(tick.created_at);
            }
            (CurrentStatus::Unknown, TickStatus::Down) => {
                // First tick ever: no incident on this edge.
                state.status = CurrentStatus::Down;
                state.streak_started_at = Some(tick.created_at);
                state.consecutive_downs = 1;
            }
            (CurrentStatus::Up, TickStatus::Up) => {
                // Streak continues.
            }
            (CurrentStatus::Up, TickStatus::Down) => {
                state.status = CurrentStatus::Down;
                state.streak_started_at = Some(tick.created_at);
                state.consecutive_downs = 1;
                state.pending_down = Some((tick.created_at, tick.id));
                if state.consecutive_downs >= self.debounce_ticks {
                    self.open_incident(state, tick.target_id, &tick.region_id)?;
                }
            }
            (CurrentStatus::Down, TickStatus::Down) => {
                state.consecutive_downs += 1;
                if state.open_incident_id.is_none()
                    && state.pending_down.is_some()
                    && state.consecutive_downs >= self.debounce_ticks
                {
                    self.open_incident(state, tick.target_id, &tick.region_id)?;
                }
            }
            (CurrentStatus::Down, TickStatus::Up) => {
                if let Some(id) = state.open_incident_id.take() {
                    if self.store.close_incident(id, tick.created_at, tick.id)? {
                        self.dispatcher
                            .incident_closed(tick.target_id, &tick.region_id, tick.created_at);
                    }
                }
                state.status = CurrentStatus::Up;
                state.streak_started_at = Some(tick.created_at);
                state.consecutive_downs = 0;
                state.pending_down = None;
            }
        }

        state.last_tick_at = Some(tick.created_at);
        Ok(())
    }

    /// Open the incident recorded by the armed down run. The opened_at is the
    /// first failing tick's time, not the one that crossed the debounce bar.
    fn open_incident(
        &self,
        state: &mut PairState,
        target_id: i64,
        region_id: &str,
    ) -> Result<(), DbError> {
        let (opened_at, trigger_tick_id) = match state.pending_down {
            Some(p) => p,
            None => return Ok(()),
        };

        let already_open = self.store.get_open_incident(target_id, region_id)?.is_some();
        let incident = self
            .store
            .open_incident(target_id, region_id, opened_at, trigger_tick_id)?;
        state.open_incident_id = Some(incident.id);

        if !already_open {
            self.dispatcher.incident_opened(target_id, region_id, opened_at);
        }
        Ok(())
    }

    /// Rebuild per-pair state from the tick log on startup, so restarts do
    /// not reset streaks or duplicate incidents.
    pub fn recover(&self, regions: &[String]) -> Result<(), DbError> {
        let targets = self.store.get_targets()?;
        let mut pairs = self.pairs.lock().unwrap();

        for target in &targets {
            for region in regions {
                let latest = match self.store.latest_tick(target.id, Some(region))? {
                    Some(t) => t,
                    None => continue,
                };

                let change = self
                    .store
                    .latest_tick_with_status_ne(target.id, Some(region), latest.status)?;

                let run_start = match &change {
                    Some(c) => self
                        .store
                        .earliest_tick_after(target.id, region, c.created_at)?
                        .unwrap_or_else(|| latest.clone()),
                    None => self
                        .store
                        .first_tick(target.id, Some(region))?
                        .unwrap_or_else(|| latest.clone()),
                };

                let open = self.store.get_open_incident(target.id, region)?;
                let mut state = PairState {
                    status: match latest.status {
                        TickStatus::Up => CurrentStatus::Up,
                        TickStatus::Down => CurrentStatus::Down,
                    },
                    streak_started_at: Some(run_start.created_at),
                    last_tick_at: Some(latest.created_at),
                    consecutive_downs: 0,
                    pending_down: None,
                    open_incident_id: None,
                };

                match latest.status {
                    TickStatus::Up => {
                        // An incident left open across a crash is closed by
                        // the recovery pass; at-least-once event delivery.
                        if let Some(incident) = open {
                            if self
                                .store
                                .close_incident(incident.id, latest.created_at, latest.id)?
                            {
                                self.dispatcher.incident_closed(
                                    target.id,
                                    region,
                                    latest.created_at,
                                );
                            }
                        }
                    }
                    TickStatus::Down => {
                        state.consecutive_downs = self
                            .store
                            .count_ticks_since(target.id, region, run_start.created_at)?
                            as u32;
                        // A run that contains the pair's first-ever tick came
                        // out of UNKNOWN and must stay unarmed.
                        if change.is_some() {
                            state.pending_down = Some((run_start.created_at, run_start.id));
                        }
                        state.open_incident_id = open.map(|i| i.id);
                    }
                }

                pairs.insert((target.id, region.clone()), state);
            }
        }

        tracing::info!("status tracker recovered {} pairs", pairs.len());
        Ok(())
    }

    /// Snapshot for one pair; `unknown` until its first tick arrives.
    pub fn snapshot(&self, target_id: i64, region_id: &str) -> StatusSnapshot {
        let pairs = self.pairs.lock().unwrap();
        let state = pairs
            .get(&(target_id, region_id.to_string()))
            .cloned()
            .unwrap_or_default();
        StatusSnapshot {
            target_id,
            region_id: region_id.to_string(),
            current_status: state.status,
            streak_started_at: state.streak_started_at,
        }
    }

    /// Composite status across regions: down if any region is down, unknown
    /// only while every region is unknown, otherwise up.
    pub fn global_status(&self, target_id: i64) -> CurrentStatus {
        let pairs = self.pairs.lock().unwrap();
        let mut saw_up = false;
        for ((tid, _), state) in pairs.iter() {
            if *tid != target_id {
                continue;
            }
            match state.status {
                CurrentStatus::Down => return CurrentStatus::Down,
                CurrentStatus::Up => saw_up = true,
                CurrentStatus::Unknown => {}
            }
        }
        if saw_up {
            CurrentStatus::Up
        } else {
            CurrentStatus::Unknown
        }
    }

    /// Drop all in-memory state for a deleted target.
    pub fn forget_target(&self, target_id: i64) {
        let mut pairs = self.pairs.lock().unwrap();
        pairs.retain(|(tid, _), _| *tid != target_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertKind;
    use crate::db::NewTick;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    const REGION: &str = "us-east-1";

    struct Fixture {
        store: Arc<Store>,
        tracker: StatusTracker,
        dispatcher: AlertDispatcher,
        target_id: i64,
        _tmp: NamedTempFile,
    }

    fn fixture(debounce: u32) -> Fixture {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let dispatcher = AlertDispatcher::new(64);
        let tracker = StatusTracker::new(store.clone(), dispatcher.clone(), debounce);
        let target = store.add_target("https://example.com", "local").unwrap();
        Fixture {
            store,
            tracker,
            dispatcher,
            target_id: target.id,
            _tmp: tmp,
        }
    }

    fn feed(f: &Fixture, status: TickStatus, at: DateTime<Utc>) -> Tick {
        let written = f
            .store
            .append_ticks(&[NewTick {
                target_id: f.target_id,
                region_id: REGION.to_string(),
                status,
                response_time_ms: 100,
                error_detail: None,
                dedup_key: None,
                created_at: at,
            }])
            .unwrap();
        let tick = written.into_iter().next().unwrap();
        f.tracker.process_tick(&tick).unwrap();
        tick
    }

    #[test]
    fn test_scenario_single_incident() {
        let f = fixture(2);
        let mut rx = f.dispatcher.subscribe();
        let base = Utc::now() - ChronoDuration::minutes(10);

        let mut ticks = Vec::new();
        for i in 0..10 {
            ticks.push(feed(&f, TickStatus::Up, base + ChronoDuration::seconds(i * 30)));
        }
        for i in 10..13 {
            ticks.push(feed(&f, TickStatus::Down, base + ChronoDuration::seconds(i * 30)));
        }
        for i in 13..17 {
            ticks.push(feed(&f, TickStatus::Up, base + ChronoDuration::seconds(i * 30)));
        }

        // One incident, opened at the first failing tick (tick 11), closed at
        // the first success after the run (tick 14).
        let n = f
            .store
            .count_incidents_opened_in(
                f.target_id,
                None,
                base - ChronoDuration::minutes(1),
                base + ChronoDuration::minutes(20),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(f.store.count_open_incidents(f.target_id, REGION).unwrap(), 0);

        let opened = rx.try_recv().expect("expected an opened event");
        assert_eq!(opened.kind, AlertKind::IncidentOpened);
        assert_eq!(opened.at, ticks[10].created_at);
        let closed = rx.try_recv().expect("expected a closed event");
        assert_eq!(closed.kind, AlertKind::IncidentClosed);
        assert_eq!(closed.at, ticks[13].created_at);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let f = fixture(1);
        let base = Utc::now() - ChronoDuration::minutes(5);

        feed(&f, TickStatus::Up, base);
        let down = feed(&f, TickStatus::Down, base + ChronoDuration::seconds(30));
        let up = feed(&f, TickStatus::Up, base + ChronoDuration::seconds(60));

        let snapshot_before = f.tracker.snapshot(f.target_id, REGION);

        // Replaying already-processed ticks changes nothing.
        f.tracker.process_tick(&down).unwrap();
        f.tracker.process_tick(&up).unwrap();

        let snapshot_after = f.tracker.snapshot(f.target_id, REGION);
        assert_eq!(snapshot_after.current_status, CurrentStatus::Up);
        assert_eq!(
            snapshot_after.streak_started_at,
            snapshot_before.streak_started_at
        );
        assert_eq!(
            f.store
                .count_incidents_opened_in(
                    f.target_id,
                    None,
                    base - ChronoDuration::minutes(1),
                    base + ChronoDuration::minutes(5),
                )
                .unwrap(),
            1
        );
        // The closed incident was not resurrected.
        assert_eq!(f.store.count_open_incidents(f.target_id, REGION).unwrap(), 0);
    }

    #[test]
    fn test_debounce_suppresses_transient_failure() {
        let f = fixture(2);
        let base = Utc::now() - ChronoDuration::minutes(5);

        feed(&f, TickStatus::Up, base);
        feed(&f, TickStatus::Down, base + ChronoDuration::seconds(30));
        feed(&f, TickStatus::Up, base + ChronoDuration::seconds(60));

        let n = f
            .store
            .count_incidents_opened_in(
                f.target_id,
                None,
                base - ChronoDuration::minutes(1),
                base + ChronoDuration::minutes(5),
            )
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_first_tick_down_opens_no_incident() {
        let f = fixture(1);
        let base = Utc::now() - ChronoDuration::minutes(5);

        for i in 0..5 {
            feed(&f, TickStatus::Down, base + ChronoDuration::seconds(i * 30));
        }

        assert_eq!(
            f.tracker.snapshot(f.target_id, REGION).current_status,
            CurrentStatus::Down
        );
        assert_eq!(f.store.count_open_incidents(f.target_id, REGION).unwrap(), 0);
    }

    #[test]
    fn test_stale_tick_rejected() {
        let f = fixture(1);
        let base = Utc::now() - ChronoDuration::minutes(5);

        feed(&f, TickStatus::Up, base);
        feed(&f, TickStatus::Up, base + ChronoDuration::seconds(60));

        // A late down tick from a delayed prober must not advance the state.
        let late = f
            .store
            .append_ticks(&[NewTick {
                target_id: f.target_id,
                region_id: REGION.to_string(),
                status: TickStatus::Down,
                response_time_ms: 0,
                error_detail: Some("timeout".to_string()),
                dedup_key: None,
                created_at: base + ChronoDuration::seconds(30),
            }])
            .unwrap();
        f.tracker.process_tick(&late[0]).unwrap();

        assert_eq!(
            f.tracker.snapshot(f.target_id, REGION).current_status,
            CurrentStatus::Up
        );
        assert_eq!(f.store.count_open_incidents(f.target_id, REGION).unwrap(), 0);
    }

    #[test]
    fn test_open_incident_invariant() {
        let f = fixture(1);
        let base = Utc::now() - ChronoDuration::minutes(10);

        feed(&f, TickStatus::Up, base);
        for i in 1..8 {
            feed(&f, TickStatus::Down, base + ChronoDuration::seconds(i * 30));
            assert!(f.store.count_open_incidents(f.target_id, REGION).unwrap() <= 1);
        }
    }

    #[test]
    fn test_recovery_preserves_streak_and_incident() {
        let f = fixture(1);
        let base = Utc::now() - ChronoDuration::minutes(10);

        feed(&f, TickStatus::Up, base);
        feed(&f, TickStatus::Down, base + ChronoDuration::seconds(30));
        feed(&f, TickStatus::Down, base + ChronoDuration::seconds(60));

        // Fresh tracker over the same store, as after a restart.
        let recovered = StatusTracker::new(f.store.clone(), AlertDispatcher::new(8), 1);
        recovered.recover(&[REGION.to_string()]).unwrap();

        let snap = recovered.snapshot(f.target_id, REGION);
        assert_eq!(snap.current_status, CurrentStatus::Down);
        assert_eq!(
            snap.streak_started_at,
            Some(base + ChronoDuration::seconds(30)),
        );
        // The open incident is adopted, not duplicated.
        let up = feed(&f, TickStatus::Up, base + ChronoDuration::seconds(90));
        recovered.process_tick(&up).unwrap();
        assert_eq!(f.store.count_open_incidents(f.target_id, REGION).unwrap(), 0);
        assert_eq!(
            f.store
                .count_incidents_opened_in(
                    f.target_id,
                    None,
                    base - ChronoDuration::minutes(1),
                    base + ChronoDuration::minutes(5),
                )
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_global_status_composite() {
        let f = fixture(1);
        let base = Utc::now() - ChronoDuration::minutes(5);

        assert_eq!(f.tracker.global_status(f.target_id), CurrentStatus::Unknown);

        feed(&f, TickStatus::Up, base);
        assert_eq!(f.tracker.global_status(f.target_id), CurrentStatus::Up);

        // Second region reporting down flips the composite.
        let down = f
            .store
            .append_ticks(&[NewTick {
                target_id: f.target_id,
                region_id: "india-1".to_string(),
                status: TickStatus::Down,
                response_time_ms: 0,
                error_detail: Some("timeout".to_string()),
                dedup_key: None,
                created_at: base + ChronoDuration::seconds(5),
            }])
            .unwrap();
        f.tracker.process_tick(&down[0]).unwrap();
        assert_eq!(f.tracker.global_status(f.target_id), CurrentStatus::Down);
    }
}
