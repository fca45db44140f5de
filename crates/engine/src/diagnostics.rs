//! Diagnostics export.
//!
//! Builds a JSON snapshot of one entity or of the whole guardian and writes
//! it to disk for support requests.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use lastseen_core::config::GuardianConfig;
use lastseen_core::data_validator::DataStats;
use lastseen_core::error::CoreError;
use lastseen_core::health::{HealthState, HealthSummary};
use lastseen_core::health_cache::CacheStats;
use lastseen_core::learning::EntityLearningRecord;
use serde::Serialize;

use crate::error::EngineResult;
use crate::persistence::PersistenceStatus;
use crate::registry::EntityMetadata;
use crate::storage::StorageStats;

/// Version reported in full-system diagnostics.
pub const GUARDIAN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Diagnostics for a single entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDiagnostics {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub health: HealthState,
    pub stats: EntityLearningRecord,
    pub metadata: Option<EntityMetadata>,
}

/// One entity line inside [`SystemDiagnostics`].
#[derive(Debug, Clone, Serialize)]
pub struct EntityOverview {
    pub entity_id: String,
    pub health: HealthState,
    pub stats: Option<EntityLearningRecord>,
    pub metadata: Option<EntityMetadata>,
}

/// Diagnostics for the whole guardian.
#[derive(Debug, Clone, Serialize)]
pub struct SystemDiagnostics {
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    pub config: GuardianConfig,
    pub data_stats: DataStats,
    pub health_summary: HealthSummary,
    pub storage: StorageStats,
    pub persistence: PersistenceStatus,
    pub cache: CacheStats,
    pub entities: Vec<EntityOverview>,
}

/// Either flavour of diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Diagnostics {
    Entity(Box<EntityDiagnostics>),
    System(Box<SystemDiagnostics>),
}

/// Result of an export: where it went and what was written.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsExport {
    pub path: PathBuf,
    pub diagnostics: Diagnostics,
}

/// `lsg_diagnostics_<entity|full>_<unix>.json` inside `dir`.
pub fn default_path(dir: &Path, entity_id: Option<&str>, at: DateTime<Utc>) -> PathBuf {
    let scope = entity_id.unwrap_or("full");
    dir.join(format!("lsg_diagnostics_{scope}_{}.json", at.timestamp()))
}

/// Check that `path` is a plain relative path with no `..`, root or
/// drive prefix.
pub fn check_relative(path: &Path) -> Result<(), CoreError> {
    let plain = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if plain {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "path must be relative to the diagnostics directory, got '{}'",
            path.display()
        )))
    }
}

/// `requested` joined onto `dir`, refusing anything that could leave it.
pub fn resolve_path(dir: &Path, requested: &Path) -> Result<PathBuf, CoreError> {
    check_relative(requested)?;
    Ok(dir.join(requested))
}

/// Write diagnostics as pretty JSON, creating parent directories.
pub async fn write(path: &Path, diagnostics: &Diagnostics) -> EngineResult<()> {
    let bytes = serde_json::to_vec_pretty(diagnostics)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    tracing::info!(path = %path.display(), "Diagnostics exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_names_scope() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let dir = Path::new("/tmp/lsg");

        assert_eq!(
            default_path(dir, Some("sensor.a"), at),
            dir.join("lsg_diagnostics_sensor.a_1700000000.json")
        );
        assert_eq!(
            default_path(dir, None, at),
            dir.join("lsg_diagnostics_full_1700000000.json")
        );
    }

    #[test]
    fn requested_paths_stay_inside_dir() {
        let dir = Path::new("/var/lib/lsg");

        assert_eq!(
            resolve_path(dir, Path::new("support/door.json")).unwrap(),
            dir.join("support/door.json")
        );
        for escaping in ["../etc/passwd", "/tmp/out.json", "a/../../b.json", ""] {
            assert!(
                matches!(resolve_path(dir, Path::new(escaping)), Err(CoreError::Validation(_))),
                "{escaping} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("diag.json");
        let diagnostics = Diagnostics::Entity(Box::new(EntityDiagnostics {
            entity_id: "sensor.a".into(),
            timestamp: Utc::now(),
            health: HealthState::Ok,
            stats: EntityLearningRecord::baseline(1.0),
            metadata: None,
        }));

        write(&path, &diagnostics).await.unwrap();
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["entity_id"], "sensor.a");
        assert_eq!(written["health"], "ok");
        assert_eq!(written["stats"]["last_event"], 1.0);
    }
}
