//! Operating modes and their threshold/alerting policy.
//!
//! The current mode is stored in the persisted configuration
//! (`modes.current`). Its multiplier is looked up every time a threshold is
//! computed; it is never frozen onto a learning record.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const MODE_NORMAL: &str = "normal";
pub const MODE_VACATION: &str = "vacation";
pub const MODE_NIGHT: &str = "night";

/// All valid mode names.
pub const VALID_MODES: &[&str] = &[MODE_NORMAL, MODE_VACATION, MODE_NIGHT];

/// Per-mode threshold and alerting behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModeConfig {
    /// Staleness threshold = interval EWMA × this multiplier.
    pub threshold_multiplier: f64,
    /// Whether notifications are dispatched at all.
    pub alert_enabled: bool,
    /// Whether entities with irregular cadence are ignored for alerting.
    pub ignore_variable: bool,
    /// Whether notifications are sent as low-priority/silent.
    pub silent_alerts: bool,
}

const NORMAL_CONFIG: ModeConfig = ModeConfig {
    threshold_multiplier: 2.5,
    alert_enabled: true,
    ignore_variable: false,
    silent_alerts: false,
};

const VACATION_CONFIG: ModeConfig = ModeConfig {
    threshold_multiplier: 4.0,
    alert_enabled: false,
    ignore_variable: true,
    silent_alerts: false,
};

const NIGHT_CONFIG: ModeConfig = ModeConfig {
    threshold_multiplier: 2.0,
    alert_enabled: true,
    ignore_variable: false,
    silent_alerts: true,
};

/// Operating profile altering sensitivity and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Normal,
    Vacation,
    Night,
}

impl Mode {
    /// Return the persisted string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => MODE_NORMAL,
            Self::Vacation => MODE_VACATION,
            Self::Night => MODE_NIGHT,
        }
    }

    /// Parse from a string, returning an error for unknown modes.
    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            MODE_NORMAL => Ok(Self::Normal),
            MODE_VACATION => Ok(Self::Vacation),
            MODE_NIGHT => Ok(Self::Night),
            other => Err(CoreError::Validation(format!(
                "Unknown mode: '{other}'. Valid modes: {}",
                VALID_MODES.join(", ")
            ))),
        }
    }

    /// Parse a persisted mode name, falling back to normal when unknown.
    pub fn from_persisted(s: &str) -> Self {
        Self::from_str(s).unwrap_or_else(|_| {
            tracing::warn!(mode = %s, "Unknown persisted mode, falling back to normal");
            Self::Normal
        })
    }

    /// Static policy for this mode.
    pub fn config(&self) -> ModeConfig {
        match self {
            Self::Normal => NORMAL_CONFIG,
            Self::Vacation => VACATION_CONFIG,
            Self::Night => NIGHT_CONFIG,
        }
    }

    /// Shorthand for `self.config().threshold_multiplier`.
    pub fn threshold_multiplier(&self) -> f64 {
        self.config().threshold_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_table_matches_policy() {
        assert_eq!(Mode::Normal.threshold_multiplier(), 2.5);
        assert_eq!(Mode::Vacation.threshold_multiplier(), 4.0);
        assert_eq!(Mode::Night.threshold_multiplier(), 2.0);

        assert!(!Mode::Vacation.config().alert_enabled);
        assert!(Mode::Vacation.config().ignore_variable);
        assert!(Mode::Night.config().silent_alerts);
        assert!(!Mode::Normal.config().silent_alerts);
    }

    #[test]
    fn parse_rejects_unknown_mode() {
        let err = Mode::from_str("party").unwrap_err();
        assert!(err.to_string().contains("normal, vacation, night"));
    }

    #[test]
    fn persisted_unknown_mode_falls_back_to_normal() {
        assert_eq!(Mode::from_persisted("party"), Mode::Normal);
        assert_eq!(Mode::from_persisted("night"), Mode::Night);
    }
}
