//! Health classification for monitored entities.
//!
//! An entity is classified purely from how long it has been silent
//! relative to its learned staleness threshold. The rules are:
//!
//! | Condition                          | State     |
//! |------------------------------------|-----------|
//! | fewer than 2 events, no threshold  | `unknown` |
//! | `elapsed < 1.1 × threshold`        | `ok`      |
//! | `elapsed < 2.0 × threshold`        | `late`    |
//! | otherwise                          | `stale`   |
//!
//! Lower bounds are inclusive: exactly `1.1 × threshold` is `late`, exactly
//! `2.0 × threshold` is `stale`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::EntityId;

// ---------------------------------------------------------------------------
// Health state constants
// ---------------------------------------------------------------------------

pub const HEALTH_OK: &str = "ok";
pub const HEALTH_LATE: &str = "late";
pub const HEALTH_STALE: &str = "stale";
pub const HEALTH_UNKNOWN: &str = "unknown";

/// All valid health state names.
pub const VALID_HEALTH_STATES: &[&str] = &[HEALTH_OK, HEALTH_LATE, HEALTH_STALE, HEALTH_UNKNOWN];

/// Slack on top of the threshold before an entity counts as late.
pub const LATE_FACTOR: f64 = 1.1;

/// Multiple of the threshold at which an entity counts as stale.
pub const STALE_FACTOR: f64 = 2.0;

/// Minimum number of observed events before a classification is trusted.
pub const MIN_EVENTS_FOR_HEALTH: u64 = 2;

// ---------------------------------------------------------------------------
// HealthState
// ---------------------------------------------------------------------------

/// Reporting timeliness of a single entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Late,
    Stale,
    #[default]
    Unknown,
}

impl HealthState {
    /// Return the persisted string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => HEALTH_OK,
            Self::Late => HEALTH_LATE,
            Self::Stale => HEALTH_STALE,
            Self::Unknown => HEALTH_UNKNOWN,
        }
    }

    /// Parse from a string, returning an error for unknown states.
    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            HEALTH_OK => Ok(Self::Ok),
            HEALTH_LATE => Ok(Self::Late),
            HEALTH_STALE => Ok(Self::Stale),
            HEALTH_UNKNOWN => Ok(Self::Unknown),
            other => Err(CoreError::Validation(format!(
                "Unknown health state: '{other}'. Valid states: {}",
                VALID_HEALTH_STATES.join(", ")
            ))),
        }
    }

    /// Late and stale are the states that warrant attention.
    pub fn is_problem(&self) -> bool {
        matches!(self, Self::Late | Self::Stale)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an entity from its silence duration and learned threshold.
///
/// Deterministic in its inputs; `elapsed` is `now - last_event_time`.
pub fn classify_elapsed(elapsed: f64, threshold: Option<f64>, event_count: u64) -> HealthState {
    if event_count < MIN_EVENTS_FOR_HEALTH {
        return HealthState::Unknown;
    }

    let threshold = match threshold {
        Some(t) if t > 0.0 && t.is_finite() => t,
        _ => return HealthState::Unknown,
    };

    if elapsed < threshold * LATE_FACTOR {
        HealthState::Ok
    } else if elapsed < threshold * STALE_FACTOR {
        HealthState::Late
    } else {
        HealthState::Stale
    }
}

// ---------------------------------------------------------------------------
// HealthSummary
// ---------------------------------------------------------------------------

/// Aggregate counts over a set of classifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub ok: usize,
    pub late: usize,
    pub stale: usize,
    pub unknown: usize,
    pub total: usize,
    /// True when at least one entity is late or stale.
    pub any_problem: bool,
    /// Ids of stale entities, sorted.
    pub stale_entities: Vec<EntityId>,
}

impl HealthSummary {
    /// Build a summary from an id → state map.
    pub fn from_states(states: &BTreeMap<EntityId, HealthState>) -> Self {
        let mut summary = Self {
            total: states.len(),
            ..Self::default()
        };

        for (entity_id, health) in states {
            match health {
                HealthState::Ok => summary.ok += 1,
                HealthState::Late => summary.late += 1,
                HealthState::Stale => {
                    summary.stale += 1;
                    summary.stale_entities.push(entity_id.clone());
                }
                HealthState::Unknown => summary.unknown += 1,
            }
        }

        summary.any_problem = summary.late + summary.stale > 0;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: f64 = 100.0;

    #[test]
    fn boundaries_follow_inclusive_lower_bounds() {
        assert_eq!(classify_elapsed(1.09 * T, Some(T), 5), HealthState::Ok);
        assert_eq!(classify_elapsed(T * LATE_FACTOR, Some(T), 5), HealthState::Late);
        assert_eq!(classify_elapsed(1.99 * T, Some(T), 5), HealthState::Late);
        assert_eq!(classify_elapsed(T * STALE_FACTOR, Some(T), 5), HealthState::Stale);
    }

    #[test]
    fn cold_start_is_unknown_regardless_of_elapsed() {
        for elapsed in [0.0, 10.0, 1e9] {
            assert_eq!(classify_elapsed(elapsed, Some(T), 0), HealthState::Unknown);
            assert_eq!(classify_elapsed(elapsed, Some(T), 1), HealthState::Unknown);
        }
    }

    #[test]
    fn missing_or_non_positive_threshold_is_unknown() {
        assert_eq!(classify_elapsed(5.0, None, 10), HealthState::Unknown);
        assert_eq!(classify_elapsed(5.0, Some(0.0), 10), HealthState::Unknown);
        assert_eq!(classify_elapsed(5.0, Some(-3.0), 10), HealthState::Unknown);
    }

    #[test]
    fn string_round_trip_and_rejection() {
        for name in VALID_HEALTH_STATES {
            assert_eq!(HealthState::from_str(name).unwrap().as_str(), *name);
        }
        assert!(HealthState::from_str("dead").is_err());
    }

    #[test]
    fn summary_counts_states() {
        let mut states = BTreeMap::new();
        states.insert("sensor.a".to_string(), HealthState::Ok);
        states.insert("sensor.b".to_string(), HealthState::Stale);
        states.insert("sensor.c".to_string(), HealthState::Late);
        states.insert("sensor.d".to_string(), HealthState::Unknown);

        let summary = HealthSummary::from_states(&states);
        assert_eq!(summary.total, 4);
        assert_eq!((summary.ok, summary.late, summary.stale, summary.unknown), (1, 1, 1, 1));
        assert!(summary.any_problem);
        assert_eq!(summary.stale_entities, vec!["sensor.b".to_string()]);
    }

    #[test]
    fn summary_of_healthy_set_has_no_problem() {
        let mut states = BTreeMap::new();
        states.insert("sensor.a".to_string(), HealthState::Ok);
        assert!(!HealthSummary::from_states(&states).any_problem);
    }
}
