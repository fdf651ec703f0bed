//! Retention manager: prunes raw ticks past the retention horizon.
//!
//! Pruning only touches the tick log; materialized incidents are history and
//! stay untouched.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Manager for deleting ticks past the retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: i64,
    stop: broadcast::Sender<()>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention_days: i64) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            retention_days,
            stop,
        }
    }

    /// Start the retention background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let retention_days = self.retention_days;
        let mut stop_rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        prune_expired(&store, retention_days);
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

fn prune_expired(store: &Store, retention_days: i64) {
    let cutoff = Utc::now() - ChronoDuration::days(retention_days);
    match store.prune_ticks_before(cutoff) {
        Ok(0) => {}
        Ok(n) => tracing::info!("RetentionManager: pruned {} ticks before {}", n, cutoff),
        Err(e) => tracing::error!("RetentionManager: prune failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewTick, TickStatus};
    use tempfile::NamedTempFile;

    #[test]
    fn test_prune_expired_respects_horizon() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let target = store.add_target("https://example.com", "local").unwrap();

        let tick = |at| NewTick {
            target_id: target.id,
            region_id: "us-east-1".to_string(),
            status: TickStatus::Up,
            response_time_ms: 50,
            error_detail: None,
            dedup_key: None,
            created_at: at,
        };

        let now = Utc::now();
        store
            .append_ticks(&[
                tick(now - ChronoDuration::days(120)),
                tick(now - ChronoDuration::days(10)),
            ])
            .unwrap();

        prune_expired(&store, 90);

        let kept = store
            .ticks_in_range(target.id, None, now - ChronoDuration::days(365), now)
            .unwrap();
        assert_eq!(kept.len(), 1);
    }
}
