//! Per-entity interval learning.
//!
//! Every observed state change feeds an exponentially weighted moving
//! average of the entity's inter-event interval. The staleness threshold is
//! that average scaled by the current mode's multiplier, and the entity's
//! health is classified against it (see [`crate::health`]).
//!
//! All logic in this module is pure: callers supply timestamps, the mode
//! multiplier and the history limit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::health::{classify_elapsed, HealthState, MIN_EVENTS_FOR_HEALTH};
use crate::technical::TechnicalContext;
use crate::types::{EntityId, EpochSecs, SECS_PER_DAY};

/// EWMA smoothing factor. Adapts to a new cadence within 3-5 events.
pub const EWMA_ALPHA: f64 = 0.3;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

pub const PROFILE_STANDARD: &str = "standard";
pub const PROFILE_COMPACT: &str = "compact";
pub const PROFILE_EXTENDED: &str = "extended";

/// All valid storage profile names.
pub const VALID_PROFILES: &[&str] = &[PROFILE_STANDARD, PROFILE_COMPACT, PROFILE_EXTENDED];

/// Size and age bounds applied to the learning store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LearningLimits {
    /// Maximum number of tracked entities.
    pub max_entities: usize,
    /// Maximum history entries kept per entity.
    pub max_history: usize,
    /// History entries older than this are pruned.
    pub max_history_age_days: u32,
}

impl LearningLimits {
    pub const fn standard() -> Self {
        Self {
            max_entities: 1000,
            max_history: 100,
            max_history_age_days: 30,
        }
    }

    pub const fn compact() -> Self {
        Self {
            max_entities: 500,
            max_history: 50,
            max_history_age_days: 30,
        }
    }

    pub const fn extended() -> Self {
        Self {
            max_entities: 2000,
            max_history: 100,
            max_history_age_days: 90,
        }
    }

    /// Resolve a named profile.
    pub fn from_profile(name: &str) -> Result<Self, CoreError> {
        match name {
            PROFILE_STANDARD => Ok(Self::standard()),
            PROFILE_COMPACT => Ok(Self::compact()),
            PROFILE_EXTENDED => Ok(Self::extended()),
            other => Err(CoreError::Validation(format!(
                "Unknown storage profile: '{other}'. Valid profiles: {}",
                VALID_PROFILES.join(", ")
            ))),
        }
    }

    /// History age bound in seconds.
    pub fn max_history_age_secs(&self) -> f64 {
        f64::from(self.max_history_age_days) * SECS_PER_DAY
    }
}

impl Default for LearningLimits {
    fn default() -> Self {
        Self::standard()
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One observed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub timestamp: EpochSecs,
    pub interval: f64,
    #[serde(default)]
    pub state: String,
}

/// Aggregate of compressed history samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryAggregate {
    /// Always `true`; distinguishes aggregates from samples on disk.
    pub compressed: bool,
    pub event_count: u64,
    pub avg_interval: f64,
    pub min_interval: f64,
    pub max_interval: f64,
    pub oldest_timestamp: EpochSecs,
    pub newest_timestamp: EpochSecs,
}

/// An entry in an entity's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryEntry {
    Aggregate(HistoryAggregate),
    Sample(HistorySample),
}

impl HistoryEntry {
    /// The most recent time covered by this entry.
    pub fn newest_timestamp(&self) -> EpochSecs {
        match self {
            Self::Aggregate(a) => a.newest_timestamp,
            Self::Sample(s) => s.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// EntityLearningRecord
// ---------------------------------------------------------------------------

/// Learned reporting statistics for a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLearningRecord {
    /// Time of the most recent observed event.
    #[serde(rename = "last_event", alias = "last_event_time")]
    pub last_event_time: EpochSecs,
    /// Smoothed inter-event interval; `None` until two events were seen.
    pub interval_ewma: Option<f64>,
    /// Reserved for variance tracking.
    #[serde(default)]
    pub interval_variance: f64,
    pub event_count: u64,
    /// `interval_ewma × multiplier` at the last update.
    pub threshold: Option<f64>,
    #[serde(default)]
    pub last_health: HealthState,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub technical_context: TechnicalContext,
}

impl EntityLearningRecord {
    /// A record holding only the baseline established by a first event.
    pub fn baseline(timestamp: EpochSecs) -> Self {
        Self {
            last_event_time: timestamp,
            interval_ewma: None,
            interval_variance: 0.0,
            event_count: 0,
            threshold: None,
            last_health: HealthState::Unknown,
            history: Vec::new(),
            technical_context: TechnicalContext::default(),
        }
    }

    /// Classify this record's health at `now`.
    pub fn classify(&self, now: EpochSecs) -> HealthState {
        classify_elapsed(now - self.last_event_time, self.threshold, self.event_count)
    }

    /// Whether enough events were seen for the classification to be trusted.
    pub fn is_learned(&self) -> bool {
        self.event_count >= MIN_EVENTS_FOR_HEALTH && self.interval_ewma.is_some()
    }

    /// Recompute the threshold from the current EWMA and `multiplier`.
    ///
    /// A non-positive product leaves no threshold, which classifies as
    /// unknown.
    pub fn rescale_threshold(&mut self, multiplier: f64) {
        self.threshold = self
            .interval_ewma
            .map(|ewma| ewma * multiplier)
            .filter(|t| *t > 0.0 && t.is_finite());
    }

    /// Keep at most `max` entries, dropping the oldest.
    pub fn truncate_history(&mut self, max: usize) {
        if self.history.len() > max {
            let excess = self.history.len() - max;
            self.history.drain(..excess);
        }
    }

}

/// Next EWMA value given the previous estimate and a new interval.
pub fn next_ewma(previous: Option<f64>, interval: f64) -> f64 {
    match previous {
        None => interval,
        Some(prev) => (1.0 - EWMA_ALPHA) * prev + EWMA_ALPHA * interval,
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// A state change as seen by the learner.
#[derive(Debug, Clone, Copy)]
pub struct StateSample<'a> {
    pub entity_id: &'a str,
    pub timestamp: EpochSecs,
    pub state: &'a str,
    pub attributes: &'a serde_json::Map<String, serde_json::Value>,
}

/// Outcome of applying one [`StateSample`].
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub entity_id: EntityId,
    /// True when this sample created the record.
    pub created: bool,
    /// Interval since the previous event, after clamping.
    pub interval: Option<f64>,
    /// True when the raw interval was negative and clamped to zero.
    pub clamped: bool,
    pub previous_health: HealthState,
    pub health: HealthState,
    /// True exactly when the record first acquired a usable EWMA.
    pub learned: bool,
}

impl Observation {
    pub fn health_changed(&self) -> bool {
        self.previous_health != self.health
    }

    /// Transitions into late/stale are persisted on the priority path.
    pub fn is_priority(&self) -> bool {
        self.health_changed() && self.health.is_problem()
    }
}

/// A classification change produced by a full evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub entity_id: EntityId,
    pub from: HealthState,
    pub to: HealthState,
}

/// Result of [`LearningStore::evaluate_all`].
#[derive(Debug, Clone, Default)]
pub struct EvaluationReport {
    pub states: BTreeMap<EntityId, HealthState>,
    pub transitions: Vec<HealthTransition>,
}

impl EvaluationReport {
    /// True if any entity moved into late or stale.
    pub fn has_priority_transition(&self) -> bool {
        self.transitions.iter().any(|t| t.to.is_problem())
    }
}

// ---------------------------------------------------------------------------
// LearningStore
// ---------------------------------------------------------------------------

/// All learned records, keyed by entity id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LearningStore {
    records: BTreeMap<EntityId, EntityLearningRecord>,
}

impl LearningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityLearningRecord> {
        self.records.get(entity_id)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.records.contains_key(entity_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &EntityLearningRecord)> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&EntityId, &mut EntityLearningRecord)> {
        self.records.iter_mut()
    }

    pub fn insert(&mut self, entity_id: EntityId, record: EntityLearningRecord) {
        self.records.insert(entity_id, record);
    }

    pub fn remove(&mut self, entity_id: &str) -> Option<EntityLearningRecord> {
        self.records.remove(entity_id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Keep only the records for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &EntityLearningRecord) -> bool) {
        self.records.retain(|id, record| keep(id, record));
    }

    /// Apply one observed state change.
    ///
    /// The first sample for an entity only establishes a baseline. Later
    /// samples update the interval EWMA, the threshold (`ewma × multiplier`),
    /// history and technical context, then re-classify at the sample time.
    ///
    /// A sample older than the previous event yields a negative interval;
    /// it is clamped to zero and applied at the previous event time.
    pub fn observe(
        &mut self,
        sample: StateSample<'_>,
        multiplier: f64,
        max_history: usize,
    ) -> Observation {
        let now = sample.timestamp;

        let Some(record) = self.records.get_mut(sample.entity_id) else {
            let mut record = EntityLearningRecord::baseline(now);
            record.event_count = 1;
            record
                .technical_context
                .update_from_attributes(sample.attributes, now);
            self.records.insert(sample.entity_id.to_string(), record);

            return Observation {
                entity_id: sample.entity_id.to_string(),
                created: true,
                interval: None,
                clamped: false,
                previous_health: HealthState::Unknown,
                health: HealthState::Unknown,
                learned: false,
            };
        };

        let previous_health = record.last_health;
        let was_learned = record.is_learned();

        let raw_interval = now - record.last_event_time;
        let clamped = raw_interval < 0.0;
        let interval = raw_interval.max(0.0);
        if clamped {
            tracing::warn!(
                entity_id = %sample.entity_id,
                raw_interval,
                "Event timestamp precedes last event, interval clamped to 0"
            );
        }

        // A clamped event is stamped at the previous event so neither the
        // clock nor the history moves backwards.
        let at = record.last_event_time.max(now);

        let ewma = next_ewma(record.interval_ewma, interval);
        record.interval_ewma = Some(ewma);
        record.rescale_threshold(multiplier);

        record.history.push(HistoryEntry::Sample(HistorySample {
            timestamp: at,
            interval,
            state: sample.state.to_string(),
        }));
        record.truncate_history(max_history);

        record.last_event_time = at;
        record.event_count += 1;

        record
            .technical_context
            .update_from_attributes(sample.attributes, at);

        let health = record.classify(at);
        record.last_health = health;

        Observation {
            entity_id: sample.entity_id.to_string(),
            created: false,
            interval: Some(interval),
            clamped,
            previous_health,
            health,
            learned: !was_learned && record.is_learned(),
        }
    }

    /// Classify a single entity at `now` without mutating it.
    pub fn classify(&self, entity_id: &str, now: EpochSecs) -> Option<HealthState> {
        self.records.get(entity_id).map(|r| r.classify(now))
    }

    /// Classify every entity at `now` without mutating the store.
    pub fn health_states(&self, now: EpochSecs) -> BTreeMap<EntityId, HealthState> {
        self.records
            .iter()
            .map(|(id, r)| (id.clone(), r.classify(now)))
            .collect()
    }

    /// Re-classify every entity at `now` and store the result as
    /// `last_health`.
    ///
    /// Needs no new events: staleness is detected from elapsed time alone.
    pub fn evaluate_all(&mut self, now: EpochSecs) -> EvaluationReport {
        let mut report = EvaluationReport::default();

        for (entity_id, record) in &mut self.records {
            let health = record.classify(now);
            if health != record.last_health {
                report.transitions.push(HealthTransition {
                    entity_id: entity_id.clone(),
                    from: record.last_health,
                    to: health,
                });
                record.last_health = health;
            }
            report.states.insert(entity_id.clone(), health);
        }

        report
    }

    /// Recompute every threshold for a new mode multiplier.
    pub fn rescale_thresholds(&mut self, multiplier: f64) {
        for record in self.records.values_mut() {
            record.rescale_threshold(multiplier);
        }
    }

    /// Evict the least recently active entities until at most `max` remain.
    ///
    /// Entities are ranked by `last_event_time` descending, ties broken by
    /// id. Returns the evicted ids.
    pub fn enforce_capacity(&mut self, max: usize) -> Vec<EntityId> {
        if self.records.len() <= max {
            return Vec::new();
        }

        let mut ranked: Vec<(EntityId, EpochSecs)> = self
            .records
            .iter()
            .map(|(id, r)| (id.clone(), r.last_event_time))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let evicted: Vec<EntityId> = ranked.into_iter().skip(max).map(|(id, _)| id).collect();
        for id in &evicted {
            self.records.remove(id);
        }
        evicted
    }
}
