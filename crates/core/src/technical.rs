//! Technical context extracted from entity attributes.
//!
//! Battery level, Zigbee link quality (LQI) and radio signal strength (RSSI)
//! are picked up best-effort from whatever attributes accompany a state
//! change. Attributes that are absent or non-numeric leave the previously
//! known reading untouched.

use serde::{Deserialize, Serialize};

use crate::types::EpochSecs;

/// Attribute names that carry a battery percentage.
pub const BATTERY_KEYS: &[&str] = &["battery_level", "battery"];
/// Attribute names that carry a link quality indicator (0-255).
pub const LQI_KEYS: &[&str] = &["linkquality", "link_quality", "lqi"];
/// Attribute names that carry a signal strength in dBm.
pub const RSSI_KEYS: &[&str] = &["rssi", "signal_strength"];

const BATTERY_LOW_PERCENT: f64 = 20.0;
const BATTERY_CRITICAL_PERCENT: f64 = 10.0;
const LQI_LOW: f64 = 50.0;
const LQI_CRITICAL: f64 = 20.0;
const RSSI_LOW_DBM: f64 = -80.0;
const RSSI_CRITICAL_DBM: f64 = -90.0;

/// Derived status of a technical reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    #[default]
    Ok,
    Low,
    Critical,
}

/// A single technical reading and when it was last seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub status: ReadingStatus,
    pub updated_at: EpochSecs,
}

/// Last-known battery, link quality and signal strength for an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnicalContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<Reading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lqi: Option<Reading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<Reading>,
}

impl TechnicalContext {
    /// Update readings from an attribute map observed at `now`.
    ///
    /// Returns `true` if any reading changed.
    pub fn update_from_attributes(
        &mut self,
        attributes: &serde_json::Map<String, serde_json::Value>,
        now: EpochSecs,
    ) -> bool {
        let mut changed = false;

        if let Some(value) = find_numeric(attributes, BATTERY_KEYS) {
            self.battery_level = Some(Reading {
                value,
                status: battery_status(value),
                updated_at: now,
            });
            changed = true;
        }
        if let Some(value) = find_numeric(attributes, LQI_KEYS) {
            self.lqi = Some(Reading {
                value,
                status: lqi_status(value),
                updated_at: now,
            });
            changed = true;
        }
        if let Some(value) = find_numeric(attributes, RSSI_KEYS) {
            self.rssi = Some(Reading {
                value,
                status: rssi_status(value),
                updated_at: now,
            });
            changed = true;
        }

        changed
    }

    /// Best-effort parse of a persisted context; anything malformed yields
    /// an empty context rather than an error.
    pub fn from_value_lossy(value: Option<&serde_json::Value>) -> Self {
        value
            .filter(|v| v.is_object())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Derive the battery status from a percentage.
pub fn battery_status(percent: f64) -> ReadingStatus {
    if percent <= BATTERY_CRITICAL_PERCENT {
        ReadingStatus::Critical
    } else if percent <= BATTERY_LOW_PERCENT {
        ReadingStatus::Low
    } else {
        ReadingStatus::Ok
    }
}

/// Derive the link status from an LQI value.
pub fn lqi_status(lqi: f64) -> ReadingStatus {
    if lqi < LQI_CRITICAL {
        ReadingStatus::Critical
    } else if lqi < LQI_LOW {
        ReadingStatus::Low
    } else {
        ReadingStatus::Ok
    }
}

/// Derive the signal status from an RSSI in dBm.
pub fn rssi_status(dbm: f64) -> ReadingStatus {
    if dbm <= RSSI_CRITICAL_DBM {
        ReadingStatus::Critical
    } else if dbm <= RSSI_LOW_DBM {
        ReadingStatus::Low
    } else {
        ReadingStatus::Ok
    }
}

/// First attribute among `keys` that holds a finite number or numeric string.
fn find_numeric(
    attributes: &serde_json::Map<String, serde_json::Value>,
    keys: &[&str],
) -> Option<f64> {
    keys.iter()
        .filter_map(|key| attributes.get(*key))
        .find_map(crate::data_validator::coerce_f64)
}
