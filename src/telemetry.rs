//! Best-effort state publication
//!
//! The controller publishes its tunables and committed limits every iteration.
//! Publication never fails the caller: with no subscribers, or no publisher at
//! all, events are simply dropped.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Sink for controller state
pub trait TelemetryPublisher: Send + Sync {
    fn publish_state(&self, name: &str, value: Value);
    fn publish_inverter_state(&self, idx: usize, name: &str, value: Value);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl TelemetryPublisher for NullPublisher {
    fn publish_state(&self, _name: &str, _value: Value) {}
    fn publish_inverter_state(&self, _idx: usize, _name: &str, _value: Value) {}
}

/// One published value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Inverter index, absent for global state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverter: Option<usize>,
    pub name: String,
    pub value: Value,
}

impl TelemetryEvent {
    /// Render as a single JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    fn send(&self, inverter: Option<usize>, name: &str, value: Value) {
        let _ = self.tx.send(TelemetryEvent {
            timestamp: chrono::Utc::now(),
            inverter,
            name: name.to_string(),
            value,
        });
    }
}

impl TelemetryPublisher for BroadcastPublisher {
    fn publish_state(&self, name: &str, value: Value) {
        self.send(None, name, value);
    }

    fn publish_inverter_state(&self, idx: usize, name: &str, value: Value) {
        self.send(Some(idx), name, value);
    }
}

/// Write every event to the trace log until all publishers are gone.
///
/// A slow drain skips what it missed and keeps going. Returns the number of
/// events logged.
pub async fn log_events(mut rx: broadcast::Receiver<TelemetryEvent>) -> u64 {
    let mut logged = 0;
    loop {
        match rx.recv().await {
            Ok(event) => {
                tracing::debug!(target: "zerofeed::telemetry", "{}", event.to_json_line());
                logged += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    target: "zerofeed::telemetry",
                    "Telemetry log lagged, {} event(s) dropped",
                    skipped
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
    logged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::new(4);
        publisher.publish_state("limit", json!(300));
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        publisher.publish_state("limit", json!(450));
        publisher.publish_inverter_state(1, "limit", json!(200));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "limit");
        assert_eq!(first.inverter, None);
        assert_eq!(first.value, json!(450));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.inverter, Some(1));
        let line = second.to_json_line();
        assert!(line.contains("\"inverter\":1"));
        assert!(line.contains("\"value\":200"));
    }

    #[tokio::test]
    async fn log_drain_survives_lag_and_stops_on_close() {
        let publisher = BroadcastPublisher::new(2);
        let rx = publisher.subscribe();
        for watts in 0..5 {
            publisher.publish_state("limit", json!(watts));
        }
        // only the newest two fit; the receiver lags before it reads them
        drop(publisher);

        assert_eq!(log_events(rx).await, 2);
    }
}
