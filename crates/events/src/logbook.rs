//! Human-readable logbook lines for guardian events.

use lastseen_core::health::HealthState;
use serde::Serialize;

use crate::bus::GuardianEvent;

/// Name every logbook entry is attributed to.
pub const LOGBOOK_NAME: &str = "Last Seen Guardian";

/// One rendered logbook line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogbookEntry {
    pub name: &'static str,
    pub message: String,
    pub icon: &'static str,
}

/// Render a guardian event for the host logbook.
pub fn describe(event: &GuardianEvent) -> LogbookEntry {
    let (message, icon) = match event {
        GuardianEvent::HealthChanged {
            entity_id,
            old_health,
            new_health,
            ..
        } => match new_health {
            HealthState::Stale => (
                format!("{entity_id} became unresponsive (from {old_health})"),
                "mdi:alert-circle",
            ),
            HealthState::Late => (
                format!("{entity_id} is reporting late (from {old_health})"),
                "mdi:clock-alert",
            ),
            HealthState::Ok => (
                format!("{entity_id} recovered to normal (from {old_health})"),
                "mdi:check-circle",
            ),
            HealthState::Unknown => (
                format!("{entity_id} health changed: {old_health} -> {new_health}"),
                "mdi:help-circle",
            ),
        },
        GuardianEvent::EntityLearned {
            entity_id,
            event_count,
            ..
        } => (
            format!("{entity_id} pattern learned after {event_count} events"),
            "mdi:brain",
        ),
        GuardianEvent::EntityRemoved {
            entity_id, reason, ..
        } => (
            format!("{entity_id} learning data removed ({})", reason.as_str()),
            "mdi:delete-clock",
        ),
    };

    LogbookEntry {
        name: LOGBOOK_NAME,
        message,
        icon,
    }
}
