//! Persistence of the guardian document.
//!
//! [`DocumentStore`] is the contract with whatever holds the document
//! (a JSON file for the daemon, memory for tests). [`GuardianStorage`] sits
//! on top of it, owns the in-memory copy and applies the default document
//! and deep-merge rules from [`lastseen_core::config`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lastseen_core::config::{
    deep_merge, default_document, GuardianConfig, SECTION_CONFIG, SECTION_DEVICES,
    SECTION_LEARNING_STATE, STORAGE_KEY, STORAGE_VERSION,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// Load/save of an opaque JSON document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// The stored document, or `None` when nothing was saved yet.
    async fn load(&self) -> EngineResult<Option<serde_json::Value>>;

    async fn save(&self, document: &serde_json::Value) -> EngineResult<()>;

    /// Move an unreadable document aside so a later save cannot overwrite
    /// it. Returns where it went, or `None` when the backend cannot do this.
    async fn quarantine(&self) -> EngineResult<Option<PathBuf>> {
        Ok(None)
    }
}

/// On-disk envelope around the document.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    key: String,
    data: serde_json::Value,
}

/// Stores the document as a JSON file.
///
/// Writes go to a sibling temp file that is then renamed over the target,
/// so a crash mid-write never leaves a truncated document behind.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| STORAGE_KEY.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self) -> EngineResult<Option<serde_json::Value>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        if envelope.version != STORAGE_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                stored = envelope.version,
                expected = STORAGE_VERSION,
                "Stored document has a different version, loading anyway"
            );
        }
        Ok(Some(envelope.data))
    }

    async fn save(&self, document: &serde_json::Value) -> EngineResult<()> {
        let envelope = Envelope {
            version: STORAGE_VERSION,
            key: STORAGE_KEY.to_string(),
            data: document.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn quarantine(&self) -> EngineResult<Option<PathBuf>> {
        let target = corrupt_path(&self.path, Utc::now().timestamp());
        tokio::fs::rename(&self.path, &target).await?;
        Ok(Some(target))
    }
}

/// `<file>.corrupt-<unix>` next to `path`.
fn corrupt_path(path: &Path, unix: i64) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| STORAGE_KEY.into());
    name.push(format!(".corrupt-{unix}"));
    path.with_file_name(name)
}

/// In-memory store with failure injection, for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    document: Mutex<Option<serde_json::Value>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `document`.
    pub fn with_document(document: serde_json::Value) -> Self {
        Self {
            document: Mutex::new(Some(document)),
            ..Self::default()
        }
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Option<serde_json::Value> {
        self.document.lock().await.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self) -> EngineResult<Option<serde_json::Value>> {
        Ok(self.document.lock().await.clone())
    }

    async fn save(&self, document: &serde_json::Value) -> EngineResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("injected save failure".into()));
        }
        *self.document.lock().await = Some(document.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GuardianStorage
// ---------------------------------------------------------------------------

/// Counts describing the stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub total_keys: usize,
    pub learning_state_entities: usize,
    pub config_present: bool,
    pub devices_count: usize,
    /// False when the stored document could not be read or preserved.
    pub writable: bool,
}

/// The guardian's view of its persisted document.
pub struct GuardianStorage {
    store: Arc<dyn DocumentStore>,
    document: serde_json::Value,
    writable: bool,
}

impl GuardianStorage {
    /// Load the document, merging it over the defaults.
    ///
    /// When nothing is stored yet the defaults are written immediately. A
    /// document that cannot be read is moved aside through
    /// [`DocumentStore::quarantine`] and defaults are used. If it cannot be
    /// moved aside, saving stays disabled so it is never overwritten.
    pub async fn load(store: Arc<dyn DocumentStore>) -> Self {
        let mut document = default_document();
        let mut writable = true;

        match store.load().await {
            Ok(Some(stored)) if stored.is_object() => {
                deep_merge(&mut document, &stored);
                tracing::debug!(
                    keys = document.as_object().map_or(0, |o| o.len()),
                    "Loaded stored document"
                );
            }
            Ok(Some(_)) => {
                tracing::error!("Stored document is not an object, using defaults");
                writable = preserve_unreadable(store.as_ref()).await;
            }
            Ok(None) => {
                tracing::info!("No stored document found, writing defaults");
                if let Err(e) = store.save(&document).await {
                    tracing::error!(error = %e, "Failed to write default document");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load stored document, using defaults");
                writable = preserve_unreadable(store.as_ref()).await;
            }
        }

        Self {
            store,
            document,
            writable,
        }
    }

    /// A top-level section, or `Null` when absent.
    pub fn section(&self, key: &str) -> &serde_json::Value {
        self.document.get(key).unwrap_or(&serde_json::Value::Null)
    }

    pub fn config(&self) -> GuardianConfig {
        GuardianConfig::from_value_lossy(self.section(SECTION_CONFIG))
    }

    pub fn learning_state(&self) -> &serde_json::Value {
        self.section(SECTION_LEARNING_STATE)
    }

    /// Replace a top-level section in memory. Call [`save`](Self::save)
    /// to persist.
    pub fn set_section(&mut self, key: &str, value: serde_json::Value) {
        if let Some(map) = self.document.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    /// Replace and persist the config section. On a failed save the
    /// previous section is restored.
    pub async fn set_config(&mut self, config: &GuardianConfig) -> EngineResult<()> {
        let value = serde_json::to_value(config)?;
        let previous = self.section(SECTION_CONFIG).clone();
        self.set_section(SECTION_CONFIG, value);

        if let Err(e) = self.save().await {
            self.set_section(SECTION_CONFIG, previous);
            return Err(e);
        }
        Ok(())
    }

    pub async fn save(&self) -> EngineResult<()> {
        if !self.writable {
            return Err(EngineError::Unavailable(
                "stored document could not be read or moved aside, saving is disabled".into(),
            ));
        }
        self.store.save(&self.document).await?;
        tracing::debug!("Document saved");
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        let count = |key: &str| self.section(key).as_object().map_or(0, |o| o.len());
        StorageStats {
            total_keys: self.document.as_object().map_or(0, |o| o.len()),
            learning_state_entities: count(SECTION_LEARNING_STATE),
            config_present: self.document.get(SECTION_CONFIG).is_some(),
            devices_count: count(SECTION_DEVICES),
            writable: self.writable,
        }
    }
}

/// Move an unreadable document aside. Returns whether saving may proceed.
async fn preserve_unreadable(store: &dyn DocumentStore) -> bool {
    match store.quarantine().await {
        Ok(Some(path)) => {
            tracing::warn!(path = %path.display(), "Unreadable document moved aside");
            true
        }
        Ok(None) => {
            tracing::error!("Unreadable document cannot be moved aside, saving disabled");
            false
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to move unreadable document aside, saving disabled");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use lastseen_core::modes::Mode;
    use serde_json::json;

    #[tokio::test]
    async fn missing_document_writes_defaults() {
        let store = Arc::new(MemoryStore::new());
        let storage = GuardianStorage::load(store.clone()).await;

        assert_eq!(store.save_count(), 1);
        assert_eq!(storage.config(), GuardianConfig::default());
        assert!(storage.learning_state().as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stored_document_is_merged_over_defaults() {
        let store = Arc::new(MemoryStore::with_document(json!({
            "config": {"modes": {"current": "vacation"}},
            "learning_state": {"sensor.a": {"last_event": 1.0, "event_count": 1}},
        })));
        let storage = GuardianStorage::load(store.clone()).await;

        assert_eq!(store.save_count(), 0);
        let config = storage.config();
        assert_eq!(config.current_mode(), Mode::Vacation);
        assert_eq!(config.global.check_every_minutes, 15);
        assert_eq!(storage.stats().learning_state_entities, 1);
        assert!(storage.section("health_history").is_object());
    }

    #[tokio::test]
    async fn json_file_store_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let store = JsonFileStore::new(&path);

        assert_matches!(store.load().await, Ok(None));
        store.save(&json!({"learning_state": {}})).await.unwrap();

        assert!(path.exists());
        assert!(!store.temp_path().exists());
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, json!({"learning_state": {}}));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["key"], STORAGE_KEY);
        assert_eq!(raw["version"], STORAGE_VERSION);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert_matches!(
            JsonFileStore::new(&path).load().await,
            Err(EngineError::Serialization(_))
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_moved_aside_before_defaults_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        let storage = GuardianStorage::load(Arc::new(JsonFileStore::new(&path))).await;
        assert_eq!(storage.config(), GuardianConfig::default());
        assert!(storage.stats().writable);

        let preserved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("store.json.corrupt-")
            })
            .collect();
        assert_eq!(preserved.len(), 1);
        assert_eq!(std::fs::read(&preserved[0]).unwrap(), b"{not json");

        storage.save().await.unwrap();
        assert_matches!(JsonFileStore::new(&path).load().await, Ok(Some(_)));
    }

    struct UnreadableStore;

    #[async_trait]
    impl DocumentStore for UnreadableStore {
        async fn load(&self) -> EngineResult<Option<serde_json::Value>> {
            Err(EngineError::Storage("disk error".into()))
        }

        async fn save(&self, _document: &serde_json::Value) -> EngineResult<()> {
            panic!("an unreadable document must not be overwritten");
        }
    }

    #[tokio::test]
    async fn unreadable_document_that_cannot_be_moved_blocks_saves() {
        let storage = GuardianStorage::load(Arc::new(UnreadableStore)).await;

        assert!(!storage.stats().writable);
        assert_matches!(storage.save().await, Err(EngineError::Unavailable(_)));
    }

    #[tokio::test]
    async fn memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail_saves(true);
        assert_matches!(store.save(&json!({})).await, Err(EngineError::Storage(_)));
        store.set_fail_saves(false);
        store.save(&json!({})).await.unwrap();
        assert_eq!(store.save_count(), 1);
    }
}
