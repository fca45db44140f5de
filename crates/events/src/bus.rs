//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] carries two kinds of traffic: [`StateChangedEvent`]s from
//! the host and [`GuardianEvent`]s emitted by the guardian itself. It is a
//! lossy fan-out for observers; the guardian receives state changes through
//! its own bounded channel. It is designed to be shared via
//! `Arc<EventBus>`.

use chrono::{DateTime, Utc};
use lastseen_core::health::HealthState;
use lastseen_core::learning::EntityLearningRecord;
use lastseen_core::types::{EntityId, EpochSecs};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// StateChangedEvent
// ---------------------------------------------------------------------------

/// A host entity changed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub entity_id: EntityId,
    /// Seconds since the Unix epoch.
    pub timestamp: EpochSecs,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl StateChangedEvent {
    pub fn new(entity_id: impl Into<String>, timestamp: EpochSecs, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            state: state.into(),
            attributes: serde_json::Map::new(),
        }
    }

    /// Attach host attributes (battery, link quality, ...).
    pub fn with_attributes(mut self, attributes: serde_json::Map<String, serde_json::Value>) -> Self {
        self.attributes = attributes;
        self
    }
}

// ---------------------------------------------------------------------------
// GuardianEvent
// ---------------------------------------------------------------------------

pub const EVENT_HEALTH_CHANGED: &str = "last_seen_guardian_health_changed";
pub const EVENT_ENTITY_LEARNED: &str = "last_seen_guardian_entity_learned";
pub const EVENT_ENTITY_REMOVED: &str = "last_seen_guardian_entity_removed";

/// Why the guardian dropped an entity's learning record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Learning was reset on request.
    Reset,
    /// The host no longer knows the entity.
    Orphaned,
    /// Evicted to stay within the entity limit.
    Evicted,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Orphaned => "orphaned",
            Self::Evicted => "evicted",
        }
    }
}

/// Events published by the guardian for long-term history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GuardianEvent {
    HealthChanged {
        entity_id: EntityId,
        old_health: HealthState,
        new_health: HealthState,
        interval_ewma: Option<f64>,
        threshold: Option<f64>,
        event_count: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        battery_level: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        lqi: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rssi: Option<f64>,
        fired_at: DateTime<Utc>,
    },
    EntityLearned {
        entity_id: EntityId,
        interval_ewma: f64,
        event_count: u64,
        fired_at: DateTime<Utc>,
    },
    EntityRemoved {
        entity_id: EntityId,
        reason: RemovalReason,
        fired_at: DateTime<Utc>,
    },
}

impl GuardianEvent {
    /// Build a health transition event from the record after the change.
    pub fn health_changed(
        entity_id: &str,
        old_health: HealthState,
        new_health: HealthState,
        record: &EntityLearningRecord,
    ) -> Self {
        let ctx = &record.technical_context;
        Self::HealthChanged {
            entity_id: entity_id.to_string(),
            old_health,
            new_health,
            interval_ewma: record.interval_ewma,
            threshold: record.threshold,
            event_count: record.event_count,
            battery_level: ctx.battery_level.as_ref().map(|r| r.value),
            lqi: ctx.lqi.as_ref().map(|r| r.value),
            rssi: ctx.rssi.as_ref().map(|r| r.value),
            fired_at: Utc::now(),
        }
    }

    pub fn entity_learned(entity_id: &str, interval_ewma: f64, event_count: u64) -> Self {
        Self::EntityLearned {
            entity_id: entity_id.to_string(),
            interval_ewma,
            event_count,
            fired_at: Utc::now(),
        }
    }

    pub fn entity_removed(entity_id: &str, reason: RemovalReason) -> Self {
        Self::EntityRemoved {
            entity_id: entity_id.to_string(),
            reason,
            fired_at: Utc::now(),
        }
    }

    /// Host-facing event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::HealthChanged { .. } => EVENT_HEALTH_CHANGED,
            Self::EntityLearned { .. } => EVENT_ENTITY_LEARNED,
            Self::EntityRemoved { .. } => EVENT_ENTITY_REMOVED,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Self::HealthChanged { entity_id, .. }
            | Self::EntityLearned { entity_id, .. }
            | Self::EntityRemoved { entity_id, .. } => entity_id,
        }
    }
}

/// Everything that travels on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    StateChanged(StateChangedEvent),
    Guardian(GuardianEvent),
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`BusEvent`].
///
/// ```rust
/// use lastseen_events::bus::{BusEvent, EventBus, StateChangedEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(BusEvent::StateChanged(StateChangedEvent::new("sensor.a", 0.0, "on")));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// With no active subscribers the event is dropped.
    pub fn publish(&self, event: BusEvent) {
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn publish_state(&self, event: StateChangedEvent) {
        self.publish(BusEvent::StateChanged(event));
    }

    pub fn publish_guardian(&self, event: GuardianEvent) {
        tracing::debug!(
            event_type = event.event_type(),
            entity_id = %event.entity_id(),
            "Guardian event published"
        );
        self.publish(BusEvent::Guardian(event));
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish_state(StateChangedEvent::new("sensor.a", 10.0, "on"));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1, e2);
        match e1 {
            BusEvent::StateChanged(ev) => assert_eq!(ev.entity_id, "sensor.a"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish_guardian(GuardianEvent::entity_learned("sensor.a", 60.0, 2));
    }

    #[test]
    fn health_changed_carries_technical_readings() {
        let mut record = EntityLearningRecord::baseline(0.0);
        record.event_count = 3;
        record.interval_ewma = Some(60.0);
        record.threshold = Some(150.0);
        let attrs = serde_json::json!({"battery": 42, "rssi": -70});
        record
            .technical_context
            .update_from_attributes(attrs.as_object().unwrap(), 0.0);

        let event = GuardianEvent::health_changed("sensor.a", HealthState::Ok, HealthState::Late, &record);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(event.event_type(), EVENT_HEALTH_CHANGED);
        assert_eq!(value["event_type"], "health_changed");
        assert_eq!(value["new_health"], "late");
        assert_eq!(value["battery_level"], 42.0);
        assert_eq!(value["rssi"], -70.0);
        assert!(value.get("lqi").is_none());
    }

    #[test]
    fn state_event_parses_without_attributes() {
        let ev: StateChangedEvent =
            serde_json::from_str(r#"{"entity_id":"sensor.a","timestamp":5.5,"state":"off"}"#).unwrap();
        assert!(ev.attributes.is_empty());
        assert_eq!(ev.timestamp, 5.5);
    }
}
