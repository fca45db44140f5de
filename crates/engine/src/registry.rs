//! Entity registry: which entities exist on the host.
//!
//! The guardian only needs the registry for orphan cleanup and for
//! enriching diagnostics. A failing registry never stops learning.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use lastseen_core::types::EntityId;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// Labels the guardian recognises on host entities.
pub const KNOWN_LABELS: &[&str] = &["zigbee", "wifi", "ble", "critical"];

/// Functional tags the guardian recognises on host entities.
pub const KNOWN_TAGS: &[&str] = &["door", "humidity", "soil_moisture", "water_leak"];

/// Host metadata about one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub entity_id: EntityId,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EntityMetadata {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            area_id: None,
            device_id: None,
            labels: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// The part of the id before the dot, e.g. `sensor`.
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or_default()
    }

    /// Drop labels and tags the guardian does not recognise.
    pub fn retain_known(mut self) -> Self {
        self.labels.retain(|l| KNOWN_LABELS.contains(&l.as_str()));
        self.tags.retain(|t| KNOWN_TAGS.contains(&t.as_str()));
        self
    }
}

#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn entities(&self) -> EngineResult<Vec<EntityMetadata>>;

    async fn entity_ids(&self) -> EngineResult<HashSet<EntityId>> {
        Ok(self
            .entities()
            .await?
            .into_iter()
            .map(|e| e.entity_id)
            .collect())
    }

    async fn find(&self, entity_id: &str) -> EngineResult<Option<EntityMetadata>> {
        Ok(self
            .entities()
            .await?
            .into_iter()
            .find(|e| e.entity_id == entity_id))
    }
}

/// A fixed registry built in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    entities: Vec<EntityMetadata>,
}

impl StaticRegistry {
    pub fn new(entities: Vec<EntityMetadata>) -> Self {
        Self {
            entities: entities.into_iter().map(EntityMetadata::retain_known).collect(),
        }
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ids.into_iter().map(EntityMetadata::new).collect())
    }
}

#[async_trait]
impl EntityRegistry for StaticRegistry {
    async fn entities(&self) -> EngineResult<Vec<EntityMetadata>> {
        Ok(self.entities.clone())
    }
}

/// Reads a JSON array of [`EntityMetadata`] on every query, so edits to
/// the file are picked up without a restart.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EntityRegistry for FileRegistry {
    async fn entities(&self) -> EngineResult<Vec<EntityMetadata>> {
        let bytes = tokio::fs::read(&self.path).await?;
        let entities: Vec<EntityMetadata> = serde_json::from_slice(&bytes)?;
        Ok(entities.into_iter().map(EntityMetadata::retain_known).collect())
    }
}

/// Group entities by area.
pub fn by_area<'a>(entities: &'a [EntityMetadata], area_id: &str) -> Vec<&'a EntityMetadata> {
    entities
        .iter()
        .filter(|e| e.area_id.as_deref() == Some(area_id))
        .collect()
}

pub fn by_tag<'a>(entities: &'a [EntityMetadata], tag: &str) -> Vec<&'a EntityMetadata> {
    entities.iter().filter(|e| e.tags.iter().any(|t| t == tag)).collect()
}

pub fn by_label<'a>(entities: &'a [EntityMetadata], label: &str) -> Vec<&'a EntityMetadata> {
    entities
        .iter()
        .filter(|e| e.labels.iter().any(|l| l == label))
        .collect()
}
