//! Alert planning and message formatting for unhealthy entities.
//!
//! Pure logic: the engine decides when a pass runs and how a message is
//! delivered. This module decides who gets notified and what they read.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::health::HealthState;
use crate::technical::{ReadingStatus, TechnicalContext};
use crate::types::{EntityId, EpochSecs};

/// Minimum time between two notifications for the same entity.
pub const NOTIFICATION_THROTTLE_SECS: f64 = 3600.0;

/// Extra spacing required for follow-up notifications within one pass.
pub const NOTIFICATION_COOLDOWN_SECS: f64 = 300.0;

/// Default `<domain>.<service>` that receives notifications.
pub const DEFAULT_NOTIFY_TARGET: &str = "notify.notify";

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

pub const SEVERITY_CRITICAL: &str = "critical";
pub const SEVERITY_WARNING: &str = "warning";
pub const SEVERITY_INFO: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn for_health(health: HealthState) -> Self {
        match health {
            HealthState::Stale => Self::Critical,
            HealthState::Late => Self::Warning,
            HealthState::Ok | HealthState::Unknown => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => SEVERITY_CRITICAL,
            Self::Warning => SEVERITY_WARNING,
            Self::Info => SEVERITY_INFO,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
        }
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// A rendered alert ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub entity_id: EntityId,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub health: HealthState,
    /// Delivered as low priority without sound.
    pub silent: bool,
}

/// Render the alert for one entity.
pub fn format_notification(
    entity_id: &str,
    health: HealthState,
    last_event: Option<EpochSecs>,
    context: Option<&TechnicalContext>,
    silent: bool,
    now: EpochSecs,
) -> Notification {
    let severity = Severity::for_health(health);

    let mut lines = vec![format!(
        "{} - Entity health: {}",
        severity.label(),
        health.as_str().to_uppercase()
    )];

    if let Some(last) = last_event {
        lines.push(String::new());
        lines.push(format!("Last seen: {}", relative_time(now - last)));
    }

    let causes = context.map(potential_causes).unwrap_or_default();
    if !causes.is_empty() {
        lines.push(String::new());
        lines.push("Potential causes:".to_string());
        lines.extend(causes.iter().take(2).map(|c| format!("- {c}")));
    }

    Notification {
        entity_id: entity_id.to_string(),
        title: format!("LSG Alert: {entity_id}"),
        message: lines.join("\n"),
        severity,
        health,
        silent,
    }
}

/// Human-readable age of an event, e.g. `"5 minutes ago"`.
pub fn relative_time(diff_secs: f64) -> String {
    if diff_secs < 60.0 {
        "Just now".to_string()
    } else if diff_secs < 3600.0 {
        format!("{} minutes ago", (diff_secs / 60.0) as u64)
    } else if diff_secs < 86_400.0 {
        format!("{} hours ago", (diff_secs / 3600.0) as u64)
    } else {
        format!("{} days ago", (diff_secs / 86_400.0) as u64)
    }
}

/// Degraded technical readings that may explain silence, worst first.
pub fn potential_causes(context: &TechnicalContext) -> Vec<&'static str> {
    let mut causes: Vec<(ReadingStatus, &'static str)> = Vec::new();
    if let Some(r) = &context.battery_level {
        causes.push((r.status, "Low battery"));
    }
    if let Some(r) = &context.lqi {
        causes.push((r.status, "Weak link quality"));
    }
    if let Some(r) = &context.rssi {
        causes.push((r.status, "Weak radio signal"));
    }
    causes.retain(|(status, _)| *status != ReadingStatus::Ok);
    causes.sort_by_key(|(status, _)| *status != ReadingStatus::Critical);
    causes.into_iter().map(|(_, cause)| cause).collect()
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Remembers when each entity was last notified.
#[derive(Debug, Default)]
pub struct NotificationThrottle {
    last_notified: HashMap<EntityId, EpochSecs>,
}

impl NotificationThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the late/stale entities due for a notification at `now` and mark
    /// them as notified.
    ///
    /// An entity is skipped when it was notified less than
    /// [`NOTIFICATION_THROTTLE_SECS`] ago. After the first pick in a pass,
    /// further picks additionally require [`NOTIFICATION_COOLDOWN_SECS`].
    pub fn plan(
        &mut self,
        states: &BTreeMap<EntityId, HealthState>,
        now: EpochSecs,
    ) -> Vec<EntityId> {
        let mut due = Vec::new();

        for (entity_id, health) in states {
            if !health.is_problem() {
                continue;
            }

            let since_last = self
                .last_notified
                .get(entity_id)
                .map_or(f64::INFINITY, |last| now - last);

            if since_last < NOTIFICATION_THROTTLE_SECS {
                continue;
            }
            if !due.is_empty() && since_last < NOTIFICATION_COOLDOWN_SECS {
                continue;
            }

            self.last_notified.insert(entity_id.clone(), now);
            due.push(entity_id.clone());
        }

        due
    }

    /// Forget an entity, e.g. after its learning was reset.
    pub fn forget(&mut self, entity_id: &str) {
        self.last_notified.remove(entity_id);
    }

    /// Forget every entity missing from `states`. Returns how many were
    /// dropped.
    pub fn prune(&mut self, states: &BTreeMap<EntityId, HealthState>) -> usize {
        let gone: Vec<EntityId> = self
            .last_notified
            .keys()
            .filter(|id| !states.contains_key(*id))
            .cloned()
            .collect();
        for id in &gone {
            self.forget(id);
        }
        gone.len()
    }

    /// Entities with a recorded notification.
    pub fn tracked(&self) -> usize {
        self.last_notified.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::technical::Reading;

    fn states(pairs: &[(&str, HealthState)]) -> BTreeMap<EntityId, HealthState> {
        pairs.iter().map(|(id, h)| (id.to_string(), *h)).collect()
    }

    #[test]
    fn plans_only_problem_entities() {
        let mut throttle = NotificationThrottle::new();
        let due = throttle.plan(
            &states(&[
                ("sensor.a", HealthState::Ok),
                ("sensor.b", HealthState::Late),
                ("sensor.c", HealthState::Stale),
                ("sensor.d", HealthState::Unknown),
            ]),
            1000.0,
        );
        assert_eq!(due, vec!["sensor.b".to_string(), "sensor.c".to_string()]);
    }

    #[test]
    fn throttles_repeat_notifications() {
        let mut throttle = NotificationThrottle::new();
        let s = states(&[("sensor.a", HealthState::Stale)]);

        assert_eq!(throttle.plan(&s, 0.0).len(), 1);
        assert!(throttle.plan(&s, 3599.0).is_empty());
        assert_eq!(throttle.plan(&s, 3600.0).len(), 1);

        throttle.forget("sensor.a");
        assert_eq!(throttle.plan(&s, 3601.0).len(), 1);
    }

    #[test]
    fn prune_drops_entities_no_longer_known() {
        let mut throttle = NotificationThrottle::new();
        throttle.plan(
            &states(&[("sensor.a", HealthState::Stale), ("sensor.b", HealthState::Late)]),
            0.0,
        );
        assert_eq!(throttle.tracked(), 2);

        let pruned = throttle.prune(&states(&[("sensor.b", HealthState::Ok)]));
        assert_eq!(pruned, 1);
        assert_eq!(throttle.tracked(), 1);
    }

    #[test]
    fn relative_time_buckets() {
        assert_eq!(relative_time(30.0), "Just now");
        assert_eq!(relative_time(125.0), "2 minutes ago");
        assert_eq!(relative_time(7300.0), "2 hours ago");
        assert_eq!(relative_time(3.5 * 86_400.0), "3 days ago");
    }

    #[test]
    fn stale_message_includes_last_seen_and_causes() {
        let context = TechnicalContext {
            battery_level: Some(Reading {
                value: 15.0,
                status: ReadingStatus::Low,
                updated_at: 0.0,
            }),
            lqi: Some(Reading {
                value: 5.0,
                status: ReadingStatus::Critical,
                updated_at: 0.0,
            }),
            rssi: None,
        };
        let n = format_notification(
            "sensor.door",
            HealthState::Stale,
            Some(0.0),
            Some(&context),
            true,
            600.0,
        );

        assert_eq!(n.title, "LSG Alert: sensor.door");
        assert_eq!(n.severity, Severity::Critical);
        assert!(n.silent);
        assert!(n.message.starts_with("CRITICAL - Entity health: STALE"));
        assert!(n.message.contains("Last seen: 10 minutes ago"));
        let weak = n.message.find("Weak link quality").unwrap();
        let battery = n.message.find("Low battery").unwrap();
        assert!(weak < battery);
    }

    #[test]
    fn healthy_context_has_no_causes() {
        assert!(potential_causes(&TechnicalContext::default()).is_empty());
    }
}
