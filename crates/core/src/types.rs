use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;

/// Monitored entities are identified by their host id, e.g. `sensor.kitchen_temp`.
pub type EntityId = String;

/// Event and evaluation times are seconds since the Unix epoch.
pub type EpochSecs = f64;

/// All exported timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Seconds in one day, used by the history age limits.
pub const SECS_PER_DAY: f64 = 86_400.0;

/// `<domain>.<object_id>`, lowercase alphanumerics and underscores.
static ENTITY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+\.[a-z0-9_]+$").expect("valid entity id regex"));

/// Current wall-clock time as fractional epoch seconds.
pub fn now_secs() -> EpochSecs {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Convert epoch seconds into a UTC timestamp, if representable.
pub fn to_timestamp(secs: EpochSecs) -> Option<Timestamp> {
    if !secs.is_finite() {
        return None;
    }
    chrono::DateTime::from_timestamp_micros((secs * 1_000_000.0) as i64)
}

/// Validate the shape of an entity id.
///
/// Neither half may start or end with an underscore and double
/// underscores are rejected, matching the host's own id rules.
pub fn validate_entity_id(entity_id: &str) -> Result<(), CoreError> {
    let valid = ENTITY_ID_RE.is_match(entity_id)
        && !entity_id.contains("__")
        && entity_id
            .split('.')
            .all(|part| !part.starts_with('_') && !part.ends_with('_'));

    if !valid {
        return Err(CoreError::Validation(format!(
            "Invalid entity id '{entity_id}': expected '<domain>.<object_id>'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_ids() {
        assert!(validate_entity_id("sensor.kitchen_temp").is_ok());
        assert!(validate_entity_id("binary_sensor.door_1").is_ok());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("sensor").is_err());
        assert!(validate_entity_id("Sensor.Kitchen").is_err());
        assert!(validate_entity_id("sensor._hidden").is_err());
        assert!(validate_entity_id("sensor.a__b").is_err());
        assert!(validate_entity_id("sensor.a.b").is_err());
    }

    #[test]
    fn epoch_secs_convert_to_timestamp() {
        let ts = to_timestamp(1_700_000_000.5).expect("representable");
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert!(to_timestamp(f64::NAN).is_none());
    }
}
