//! Alert dispatcher hook.
//!
//! The engine only emits incident-boundary events; delivery (email, webhook,
//! pager) is an external consumer subscribing to the broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    IncidentOpened,
    IncidentClosed,
    /// Synthetic event from the alert-test endpoint; no monitoring state
    /// is mutated.
    Test,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub target_id: i64,
    pub region_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Fan-out hook for incident events.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: broadcast::Sender<AlertEvent>,
}

impl AlertDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: AlertEvent) {
        tracing::debug!(
            kind = ?event.kind,
            target_id = event.target_id,
            region = event.region_id.as_deref().unwrap_or("global"),
            "alert event"
        );
        let _ = self.tx.send(event);
    }

    pub fn incident_opened(&self, target_id: i64, region_id: &str, at: DateTime<Utc>) {
        self.emit(AlertEvent {
            kind: AlertKind::IncidentOpened,
            target_id,
            region_id: Some(region_id.to_string()),
            at,
        });
    }

    pub fn incident_closed(&self, target_id: i64, region_id: &str, at: DateTime<Utc>) {
        self.emit(AlertEvent {
            kind: AlertKind::IncidentClosed,
            target_id,
            region_id: Some(region_id.to_string()),
            at,
        });
    }

    pub fn test(&self, target_id: i64) {
        self.emit(AlertEvent {
            kind: AlertKind::Test,
            target_id,
            region_id: None,
            at: Utc::now(),
        });
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_alert_test_emits_exactly_one_event() {
        let dispatcher = AlertDispatcher::new(8);
        let mut rx = dispatcher.subscribe();

        dispatcher.test(7);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, AlertKind::Test);
        assert_eq!(ev.target_id, 7);
        assert!(ev.region_id.is_none());
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let dispatcher = AlertDispatcher::new(8);
        dispatcher.incident_opened(1, "us-east-1", Utc::now());
    }
}
