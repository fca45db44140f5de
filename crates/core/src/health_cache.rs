//! LRU + TTL memoization of health classifications.
//!
//! Pure data structure: callers pass the current time explicitly so the
//! cache can be driven deterministically in tests.

use std::collections::HashMap;

use serde::Serialize;

use crate::health::HealthState;
use crate::types::{EntityId, EpochSecs};

/// Default time-to-live of a cached classification.
pub const DEFAULT_CACHE_TTL_SECS: f64 = 60.0;

/// Default maximum number of cached entities.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    health: HealthState,
    stored_at: EpochSecs,
    /// Monotonic access counter; the smallest value is least recently used.
    last_access: u64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_seconds: f64,
    pub hits: u64,
    pub misses: u64,
    /// Hits as a percentage of lookups, rounded to two decimals.
    pub hit_rate_percent: f64,
    pub evictions: u64,
}

/// Bounded cache of entity health keyed by entity id.
#[derive(Debug)]
pub struct HealthCache {
    entries: HashMap<EntityId, CacheEntry>,
    ttl: f64,
    capacity: usize,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl HealthCache {
    pub fn new(ttl_secs: f64, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(DEFAULT_CACHE_CAPACITY)),
            ttl: ttl_secs,
            capacity: capacity.max(1),
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up a cached classification.
    ///
    /// An expired entry counts as a miss and is removed.
    pub fn get(&mut self, entity_id: &str, now: EpochSecs) -> Option<HealthState> {
        let Some(entry) = self.entries.get_mut(entity_id) else {
            self.misses += 1;
            return None;
        };

        if now - entry.stored_at > self.ttl {
            self.entries.remove(entity_id);
            self.misses += 1;
            return None;
        }

        self.tick += 1;
        entry.last_access = self.tick;
        self.hits += 1;
        Some(entry.health)
    }

    /// Store a classification, evicting the least recently used entry when
    /// the cache is full.
    pub fn set(&mut self, entity_id: &str, health: HealthState, now: EpochSecs) {
        self.tick += 1;
        let entry = CacheEntry {
            health,
            stored_at: now,
            last_access: self.tick,
        };

        if let Some(existing) = self.entries.get_mut(entity_id) {
            *existing = entry;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.entries.insert(entity_id.to_string(), entry);
    }

    pub fn invalidate(&mut self, entity_id: &str) {
        self.entries.remove(entity_id);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        tracing::debug!("Health cache cleared");
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&mut self, now: EpochSecs) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| now - e.stored_at <= ttl);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "Removed expired health cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        let hit_rate = if lookups > 0 {
            (self.hits as f64 / lookups as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        CacheStats {
            size: self.entries.len(),
            max_size: self.capacity,
            ttl_seconds: self.ttl,
            hits: self.hits,
            misses: self.misses,
            hit_rate_percent: hit_rate,
            evictions: self.evictions,
        }
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.entries.remove(&id);
            self.evictions += 1;
        }
    }
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL_SECS, DEFAULT_CACHE_CAPACITY)
    }
}
