use std::path::{Path, PathBuf};
use std::time::Duration;

use lastseen_core::learning::{LearningLimits, PROFILE_STANDARD};
use lastseen_engine::persistence::{
    PersistenceConfig, DEFAULT_BACKSTOP, DEFAULT_DEBOUNCE, DEFAULT_PRIORITY_DELAY,
};

const DEFAULT_STORE_PATH: &str = ".storage/last_seen_guardian.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// JSON document holding config and learning state.
    pub store_path: PathBuf,
    /// Name of the learning profile.
    pub profile: String,
    pub limits: LearningLimits,
    pub persistence: PersistenceConfig,
    /// Diagnostics exports are confined to this directory.
    pub diagnostics_dir: PathBuf,
    /// JSON array of host entities; orphan cleanup is disabled without it.
    pub registry_path: Option<PathBuf>,
    /// Directory containing `panel.js`; the panel is not registered without it.
    pub panel_dir: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl DaemonConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                             |
    /// |---------------------------|-------------------------------------|
    /// | `LSG_STORE_PATH`          | `.storage/last_seen_guardian.json`  |
    /// | `LSG_PROFILE`             | `standard` (`compact`, `extended`)  |
    /// | `LSG_DEBOUNCE_SECS`       | `30`                                |
    /// | `LSG_PRIORITY_DELAY_SECS` | `5`                                 |
    /// | `LSG_BACKSTOP_SECS`       | `300`                               |
    /// | `LSG_DIAGNOSTICS_DIR`     | directory of `LSG_STORE_PATH`       |
    /// | `LSG_REGISTRY_PATH`       | unset                               |
    /// | `LSG_PANEL_DIR`           | unset                               |
    /// | `LSG_LOG_FORMAT`          | `pretty` (`json`)                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store_path: PathBuf = lookup("LSG_STORE_PATH")
            .unwrap_or_else(|| DEFAULT_STORE_PATH.into())
            .into();

        let profile = lookup("LSG_PROFILE").unwrap_or_else(|| PROFILE_STANDARD.into());
        let limits = LearningLimits::from_profile(&profile).map_err(|_| ConfigError::Invalid {
            var: "LSG_PROFILE",
            expected: "one of standard, compact, extended",
            value: profile.clone(),
        })?;

        let persistence = PersistenceConfig {
            debounce: secs(&lookup, "LSG_DEBOUNCE_SECS", DEFAULT_DEBOUNCE)?,
            priority_delay: secs(&lookup, "LSG_PRIORITY_DELAY_SECS", DEFAULT_PRIORITY_DELAY)?,
            backstop: secs(&lookup, "LSG_BACKSTOP_SECS", DEFAULT_BACKSTOP)?,
        };

        let diagnostics_dir = lookup("LSG_DIAGNOSTICS_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| store_dir(&store_path));

        let registry_path = lookup("LSG_REGISTRY_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let panel_dir = lookup("LSG_PANEL_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let log_format = match lookup("LSG_LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "LSG_LOG_FORMAT",
                    expected: "pretty or json",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            store_path,
            profile,
            limits,
            persistence,
            diagnostics_dir,
            registry_path,
            panel_dir,
            log_format,
        })
    }
}

fn store_dir(store_path: &Path) -> PathBuf {
    match store_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(Duration::from_secs(n)),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a positive number of seconds",
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<DaemonConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.store_path, PathBuf::from(DEFAULT_STORE_PATH));
        assert_eq!(config.diagnostics_dir, PathBuf::from(".storage"));
        assert_eq!(config.limits, LearningLimits::standard());
        assert_eq!(config.persistence, PersistenceConfig::default());
        assert!(config.registry_path.is_none());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_pairs(&[
            ("LSG_PROFILE", "extended"),
            ("LSG_DEBOUNCE_SECS", "10"),
            ("LSG_REGISTRY_PATH", "/etc/lsg/entities.json"),
            ("LSG_LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.limits.max_entities, 2000);
        assert_eq!(config.persistence.debounce, Duration::from_secs(10));
        assert_eq!(config.persistence.backstop, DEFAULT_BACKSTOP);
        assert_eq!(config.registry_path, Some(PathBuf::from("/etc/lsg/entities.json")));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn diagnostics_dir_follows_store_path() {
        let config = from_pairs(&[("LSG_STORE_PATH", "/var/lib/lsg/store.json")]).unwrap();
        assert_eq!(config.diagnostics_dir, PathBuf::from("/var/lib/lsg"));

        let config = from_pairs(&[("LSG_STORE_PATH", "store.json")]).unwrap();
        assert_eq!(config.diagnostics_dir, PathBuf::from("."));

        let config = from_pairs(&[("LSG_DIAGNOSTICS_DIR", "/tmp/lsg")]).unwrap();
        assert_eq!(config.diagnostics_dir, PathBuf::from("/tmp/lsg"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_matches!(
            from_pairs(&[("LSG_PROFILE", "huge")]),
            Err(ConfigError::Invalid { var: "LSG_PROFILE", .. })
        );
        assert_matches!(
            from_pairs(&[("LSG_BACKSTOP_SECS", "0")]),
            Err(ConfigError::Invalid { var: "LSG_BACKSTOP_SECS", .. })
        );
        assert_matches!(
            from_pairs(&[("LSG_LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { var: "LSG_LOG_FORMAT", .. })
        );
    }
}
