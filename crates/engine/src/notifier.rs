//! Notification manager.
//!
//! [`NotificationManager`] runs as a background task. Every minute it asks
//! the guardian for an [`AlertSnapshot`], picks the late/stale entities
//! due for an alert (per-entity throttle plus a cooldown between alerts in
//! the same pass) and hands rendered notifications to a
//! [`NotificationSink`].
//!
//! With a bus subscription attached, throttle entries are dropped as soon
//! as the guardian removes an entity. Each pass also prunes entries for
//! entities the snapshot no longer contains.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lastseen_core::notification::{format_notification, Notification, NotificationThrottle};
use lastseen_events::{BusEvent, GuardianEvent};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;
use crate::guardian::{AlertSnapshot, GuardianHandle};

/// How often the manager polls health states.
pub const NOTIFICATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// NotificationSink
// ---------------------------------------------------------------------------

/// Delivery channel for rendered notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification to `target` (`<domain>.<service>`).
    async fn send(&self, target: &str, notification: &Notification) -> EngineResult<()>;
}

/// Writes notifications to the log.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn send(&self, target: &str, notification: &Notification) -> EngineResult<()> {
        tracing::warn!(
            target_service = %target,
            entity_id = %notification.entity_id,
            severity = notification.severity.as_str(),
            health = notification.health.as_str(),
            silent = notification.silent,
            title = %notification.title,
            message = %notification.message,
            "Notification"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NotificationManager
// ---------------------------------------------------------------------------

pub struct NotificationManager {
    handle: GuardianHandle,
    sink: Arc<dyn NotificationSink>,
    throttle: NotificationThrottle,
    events: Option<broadcast::Receiver<BusEvent>>,
}

impl NotificationManager {
    pub fn new(handle: GuardianHandle, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            handle,
            sink,
            throttle: NotificationThrottle::new(),
            events: None,
        }
    }

    /// Follow guardian events on the bus to forget removed entities.
    pub fn with_events(mut self, rx: broadcast::Receiver<BusEvent>) -> Self {
        self.events = Some(rx);
        self
    }

    /// Run until cancelled. The first check happens one interval after start.
    pub async fn run(mut self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + NOTIFICATION_CHECK_INTERVAL;
        let mut interval = tokio::time::interval_at(start, NOTIFICATION_CHECK_INTERVAL);
        let mut events = self.events.take();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Notification manager stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.check().await {
                        tracing::error!(error = %e, "Notification check failed");
                    }
                }
                received = next_event(&mut events) => match received {
                    Ok(event) => self.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Notification manager lagged, next pass prunes");
                    }
                    Err(broadcast::error::RecvError::Closed) => events = None,
                },
            }
        }
    }

    fn on_event(&mut self, event: &BusEvent) {
        if let BusEvent::Guardian(GuardianEvent::EntityRemoved { entity_id, reason, .. }) = event {
            self.throttle.forget(entity_id);
            tracing::debug!(
                entity_id = %entity_id,
                reason = reason.as_str(),
                "Notification throttle cleared"
            );
        }
    }

    /// One polling pass. Returns how many notifications were delivered.
    pub async fn check(&mut self) -> EngineResult<usize> {
        let snapshot = self.handle.alert_snapshot().await?;
        Ok(self.process(&snapshot).await)
    }

    async fn process(&mut self, snapshot: &AlertSnapshot) -> usize {
        let pruned = self.throttle.prune(&snapshot.states);
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped throttle entries for removed entities");
        }

        let mode = snapshot.mode.config();
        if !mode.alert_enabled || !snapshot.enable_notifications {
            tracing::debug!(
                mode = snapshot.mode.as_str(),
                enable_notifications = snapshot.enable_notifications,
                "Notifications disabled, skipping check"
            );
            return 0;
        }

        let mut sent = 0;
        for entity_id in self.throttle.plan(&snapshot.states, snapshot.now) {
            let Some(health) = snapshot.states.get(&entity_id).copied() else {
                continue;
            };
            let candidate = snapshot.candidates.get(&entity_id);
            let notification = format_notification(
                &entity_id,
                health,
                candidate.map(|c| c.last_event),
                candidate.map(|c| &c.technical_context),
                mode.silent_alerts,
                snapshot.now,
            );

            match self.sink.send(&snapshot.notify_target, &notification).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::error!(
                    entity_id = %entity_id,
                    error = %e,
                    "Failed to deliver notification"
                ),
            }
        }

        if sent > 0 {
            tracing::info!(sent, "Notifications delivered");
        }
        sent
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<BusEvent>>,
) -> Result<BusEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
