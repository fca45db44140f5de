//! Persisted guardian configuration and the stored document layout.
//!
//! The document kept in the external store has four top-level sections:
//!
//! ```json
//! {
//!   "devices": {},
//!   "config": { "global": { ... }, "modes": { "current": "normal", ... } },
//!   "learning_state": { "<entity_id>": { ... } },
//!   "health_history": {}
//! }
//! ```
//!
//! Loading deep-merges the stored document over [`default_document`], so a
//! document written by an older version gains any newly added keys.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::CoreError;
use crate::modes::{Mode, VALID_MODES};
use crate::notification::DEFAULT_NOTIFY_TARGET;

/// Key under which the document is stored.
pub const STORAGE_KEY: &str = "last_seen_guardian_store";

/// Layout version of the stored document.
pub const STORAGE_VERSION: u32 = 1;

pub const SECTION_DEVICES: &str = "devices";
pub const SECTION_CONFIG: &str = "config";
pub const SECTION_LEARNING_STATE: &str = "learning_state";
pub const SECTION_HEALTH_HISTORY: &str = "health_history";

pub const DEFAULT_CHECK_EVERY_MINUTES: u32 = 15;
pub const DEFAULT_ALERT_THRESHOLD_MULTIPLIER: f64 = 2.5;

// ---------------------------------------------------------------------------
// GuardianConfig
// ---------------------------------------------------------------------------

/// Global behaviour settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GlobalConfig {
    /// Minutes between full evaluation passes.
    #[validate(range(min = 1, max = 1440))]
    pub check_every_minutes: u32,
    /// Persisted for compatibility; thresholds use the mode multiplier.
    #[validate(range(exclusive_min = 0.0))]
    pub alert_threshold_multiplier: f64,
    pub enable_notifications: bool,
    /// `<domain>.<service>` receiving notifications.
    #[validate(custom(function = "validate_notify_target"))]
    pub notify_target: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            check_every_minutes: DEFAULT_CHECK_EVERY_MINUTES,
            alert_threshold_multiplier: DEFAULT_ALERT_THRESHOLD_MULTIPLIER,
            enable_notifications: true,
            notify_target: DEFAULT_NOTIFY_TARGET.to_string(),
        }
    }
}

/// Mode selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModesConfig {
    #[validate(custom(function = "validate_mode_name"))]
    pub current: String,
    pub available: Vec<String>,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            current: Mode::default().as_str().to_string(),
            available: VALID_MODES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// The `config` section of the stored document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct GuardianConfig {
    #[validate(nested)]
    pub global: GlobalConfig,
    #[validate(nested)]
    pub modes: ModesConfig,
}

impl GuardianConfig {
    /// The active mode; an unknown persisted name falls back to normal.
    pub fn current_mode(&self) -> Mode {
        Mode::from_persisted(&self.modes.current)
    }

    /// Validate all fields, mapping failures into [`CoreError::Validation`].
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string().replace('\n', "; ")))
    }

    /// Parse a stored `config` section, merging it over the defaults.
    ///
    /// Never fails: a section that does not deserialize yields the defaults.
    pub fn from_value_lossy(value: &serde_json::Value) -> Self {
        let mut merged = default_config_value();
        deep_merge(&mut merged, value);
        serde_json::from_value(merged).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Stored config is malformed, using defaults");
            Self::default()
        })
    }

    /// Deep-merge a partial update into this config and validate the result.
    ///
    /// On error `self` is left untouched.
    pub fn merged_with(&self, partial: &serde_json::Value) -> Result<Self, CoreError> {
        if !partial.is_object() {
            return Err(CoreError::Validation(
                "Config update must be an object".to_string(),
            ));
        }

        let mut value = serde_json::to_value(self)
            .map_err(|e| CoreError::Internal(format!("config not serializable: {e}")))?;
        deep_merge(&mut value, partial);

        let updated: Self = serde_json::from_value(value)
            .map_err(|e| CoreError::Validation(format!("Invalid config update: {e}")))?;
        updated.check()?;
        Ok(updated)
    }
}

fn validate_notify_target(target: &str) -> Result<(), ValidationError> {
    match target.split_once('.') {
        Some((domain, service)) if !domain.is_empty() && !service.is_empty() => Ok(()),
        _ => Err(ValidationError::new("notify_target_format")),
    }
}

fn validate_mode_name(mode: &str) -> Result<(), ValidationError> {
    if VALID_MODES.contains(&mode) {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_mode"))
    }
}

// ---------------------------------------------------------------------------
// Document helpers
// ---------------------------------------------------------------------------

fn default_config_value() -> serde_json::Value {
    serde_json::to_value(GuardianConfig::default()).unwrap_or_default()
}

/// The document written when nothing is stored yet.
pub fn default_document() -> serde_json::Value {
    serde_json::json!({
        SECTION_DEVICES: {},
        SECTION_CONFIG: default_config_value(),
        SECTION_LEARNING_STATE: {},
        SECTION_HEALTH_HISTORY: {},
    })
}

/// Recursively merge `updates` into `base`.
///
/// Objects merge key by key; every other value (arrays included) replaces
/// the value in `base`.
pub fn deep_merge(base: &mut serde_json::Value, updates: &serde_json::Value) {
    match (base, updates) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, updates) => *base = updates.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn deep_merge_preserves_siblings_and_replaces_arrays() {
        let mut base = json!({
            "global": {"check_every_minutes": 15, "enable_notifications": true},
            "modes": {"current": "normal", "available": ["normal", "vacation", "night"]},
        });
        deep_merge(
            &mut base,
            &json!({"modes": {"current": "vacation", "available": ["night"]}}),
        );

        assert_eq!(base["global"]["check_every_minutes"], 15);
        assert_eq!(base["modes"]["current"], "vacation");
        assert_eq!(base["modes"]["available"], json!(["night"]));
    }

    #[test]
    fn default_document_has_all_sections() {
        let doc = default_document();
        for section in [
            SECTION_DEVICES,
            SECTION_CONFIG,
            SECTION_LEARNING_STATE,
            SECTION_HEALTH_HISTORY,
        ] {
            assert!(doc[section].is_object(), "missing {section}");
        }
        assert_eq!(doc["config"]["global"]["notify_target"], "notify.notify");
        assert_eq!(doc["config"]["modes"]["current"], "normal");
    }

    #[test]
    fn partial_stored_config_gains_defaults() {
        let config = GuardianConfig::from_value_lossy(&json!({"modes": {"current": "night"}}));
        assert_eq!(config.current_mode(), Mode::Night);
        assert_eq!(config.global.check_every_minutes, DEFAULT_CHECK_EVERY_MINUTES);
    }

    #[test]
    fn malformed_stored_config_falls_back() {
        let config = GuardianConfig::from_value_lossy(&json!({"global": {"check_every_minutes": "soon"}}));
        assert_eq!(config, GuardianConfig::default());
    }

    #[test]
    fn merged_with_validates() {
        let config = GuardianConfig::default();

        let updated = config
            .merged_with(&json!({"global": {"check_every_minutes": 5}}))
            .unwrap();
        assert_eq!(updated.global.check_every_minutes, 5);
        assert!(updated.global.enable_notifications);

        assert_matches!(
            config.merged_with(&json!({"global": {"check_every_minutes": 0}})),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            config.merged_with(&json!({"modes": {"current": "party"}})),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            config.merged_with(&json!({"global": {"notify_target": "nodot"}})),
            Err(CoreError::Validation(_))
        );
        assert_matches!(config.merged_with(&json!(3)), Err(CoreError::Validation(_)));
    }
}
