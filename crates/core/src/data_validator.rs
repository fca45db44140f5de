//! Validation and cleanup of persisted learning state.
//!
//! Runs on every load from the document store and before every flush. It
//! never fails on malformed input: it always returns a best-effort cleaned
//! [`LearningStore`] together with a message describing what was fixed.

use std::collections::HashSet;

use serde::Serialize;

use crate::health::HealthState;
use crate::learning::{
    EntityLearningRecord, HistoryAggregate, HistoryEntry, LearningLimits, LearningStore,
};
use crate::technical::TechnicalContext;
use crate::types::{EntityId, EpochSecs, SECS_PER_DAY};

/// Samples kept verbatim by a default history compression.
pub const DEFAULT_COMPRESS_KEEP_LAST: usize = 20;

/// Samples older than this many days are folded by a default compression.
pub const DEFAULT_COMPRESS_OLDER_THAN_DAYS: u32 = 7;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// What a validation pass had to fix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Entities evicted by the size cap.
    pub pruned_entities: usize,
    /// Entities dropped because they were unusable.
    pub dropped_records: Vec<EntityId>,
    /// Numeric fields reset to a default after failed coercion.
    pub coerced_fields: usize,
    /// Records whose `last_health` was not a valid state.
    pub reset_health: usize,
    /// History entries dropped for age, size or shape.
    pub pruned_history: usize,
    /// Records whose `technical_context` had to be replaced.
    pub repaired_context: usize,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }

    fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.pruned_entities > 0 {
            issues.push(format!("pruned {} entities over size cap", self.pruned_entities));
        }
        if !self.dropped_records.is_empty() {
            issues.push(format!("dropped {} invalid records", self.dropped_records.len()));
        }
        if self.coerced_fields > 0 {
            issues.push(format!("reset {} non-numeric fields", self.coerced_fields));
        }
        if self.reset_health > 0 {
            issues.push(format!("reset {} invalid health states", self.reset_health));
        }
        if self.pruned_history > 0 {
            issues.push(format!("pruned {} history entries", self.pruned_history));
        }
        if self.repaired_context > 0 {
            issues.push(format!("repaired {} technical contexts", self.repaired_context));
        }
        issues
    }
}

/// Result of [`validate_and_clean`].
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// False only when the input was not a mapping at all.
    pub ok: bool,
    pub message: String,
    pub store: LearningStore,
    pub report: ValidationReport,
}

/// Aggregate statistics over a learning store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataStats {
    pub entity_count: usize,
    pub total_events: u64,
    pub total_history_items: usize,
    pub oldest_event: Option<EpochSecs>,
    pub newest_event: Option<EpochSecs>,
}

/// Result of [`compress_history`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompressionReport {
    pub entities_compressed: usize,
    pub samples_compressed: usize,
}

// ---------------------------------------------------------------------------
// Coercion helpers
// ---------------------------------------------------------------------------

/// Interpret a JSON number or numeric string as a finite float.
pub fn coerce_f64(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Interpret a JSON number or numeric string as an integer count.
///
/// Negative values are clamped to zero; fractional values are truncated.
pub fn coerce_count(value: &serde_json::Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    if let Some(n) = value.as_i64() {
        return Some(n.max(0) as u64);
    }
    match value {
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok().map(|n| n.max(0) as u64),
        serde_json::Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(|f| f.max(0.0) as u64),
        _ => None,
    }
}

/// Coerce an optional continuous estimator; failures and non-positive
/// thresholds become `None`.
fn coerce_optional(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
    report: &mut ValidationReport,
) -> Option<f64> {
    match obj.get(key) {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => {
            let coerced = coerce_f64(value);
            if coerced.is_none() {
                report.coerced_fields += 1;
            }
            coerced
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate and clean a raw persisted learning state.
///
/// - Non-mapping input is rejected (`ok = false`, empty store).
/// - Records that are not mappings, lack `last_event`/`event_count`, or have
///   a non-numeric `last_event` are dropped.
/// - Counters that fail coercion become `0`; estimators become `null`.
/// - Invalid `last_health` becomes `unknown`; `technical_context` is always
///   a mapping afterwards.
/// - History entries older than the age limit or malformed are dropped and
///   the rest truncated to the most recent `max_history`.
/// - Finally the size cap keeps the most recently active entities.
///
/// Running it on its own output yields an identical store.
pub fn validate_and_clean(
    raw: &serde_json::Value,
    limits: &LearningLimits,
    now: EpochSecs,
) -> ValidationOutcome {
    let Some(entities) = raw.as_object() else {
        return ValidationOutcome {
            ok: false,
            message: "learning_state must be a mapping".to_string(),
            store: LearningStore::new(),
            report: ValidationReport::default(),
        };
    };

    let mut report = ValidationReport::default();
    let mut store = LearningStore::new();

    for (entity_id, value) in entities {
        match clean_record(entity_id, value, limits, now, &mut report) {
            Some(record) => store.insert(entity_id.clone(), record),
            None => report.dropped_records.push(entity_id.clone()),
        }
    }

    let evicted = store.enforce_capacity(limits.max_entities);
    if !evicted.is_empty() {
        tracing::warn!(
            pruned = evicted.len(),
            max_entities = limits.max_entities,
            "Learning state exceeds size limit, pruned least recently active entities"
        );
        report.pruned_entities = evicted.len();
    }

    let issues = report.issues();
    let message = if issues.is_empty() {
        "Learning state validated".to_string()
    } else {
        format!("Learning state validated: {}", issues.join(", "))
    };

    ValidationOutcome {
        ok: true,
        message,
        store,
        report,
    }
}

/// Validate an in-memory store through the same rules as persisted data.
pub fn validate_store(
    store: &LearningStore,
    limits: &LearningLimits,
    now: EpochSecs,
) -> ValidationOutcome {
    match serde_json::to_value(store) {
        Ok(raw) => validate_and_clean(&raw, limits, now),
        Err(e) => {
            // Only reachable with non-string map keys, which the store cannot hold.
            tracing::error!(error = %e, "Failed to serialize learning store for validation");
            ValidationOutcome {
                ok: false,
                message: format!("learning state not serializable: {e}"),
                store: store.clone(),
                report: ValidationReport::default(),
            }
        }
    }
}

fn clean_record(
    entity_id: &str,
    value: &serde_json::Value,
    limits: &LearningLimits,
    now: EpochSecs,
    report: &mut ValidationReport,
) -> Option<EntityLearningRecord> {
    let Some(obj) = value.as_object() else {
        tracing::warn!(entity_id = %entity_id, "Invalid learning record, skipping");
        return None;
    };

    let last_event = obj.get("last_event").or_else(|| obj.get("last_event_time"));
    let (Some(last_event), Some(event_count)) = (last_event, obj.get("event_count")) else {
        tracing::warn!(entity_id = %entity_id, "Learning record missing required fields, skipping");
        return None;
    };

    let Some(last_event_time) = coerce_f64(last_event) else {
        tracing::warn!(entity_id = %entity_id, "Learning record has non-numeric last_event, skipping");
        return None;
    };

    let event_count = coerce_count(event_count).unwrap_or_else(|| {
        tracing::warn!(entity_id = %entity_id, "Invalid event_count, resetting to 0");
        report.coerced_fields += 1;
        0
    });

    let interval_ewma = coerce_optional(obj, "interval_ewma", report);
    let threshold = match coerce_optional(obj, "threshold", report) {
        Some(t) if t <= 0.0 => {
            report.coerced_fields += 1;
            None
        }
        other => other,
    };

    let interval_variance = match obj.get("interval_variance") {
        None | Some(serde_json::Value::Null) => 0.0,
        Some(v) => coerce_f64(v).unwrap_or_else(|| {
            report.coerced_fields += 1;
            0.0
        }),
    };

    let last_health = match obj.get("last_health").and_then(|v| v.as_str()) {
        Some(s) => HealthState::from_str(s).unwrap_or_else(|_| {
            report.reset_health += 1;
            HealthState::Unknown
        }),
        None => {
            if obj.contains_key("last_health") {
                report.reset_health += 1;
            }
            HealthState::Unknown
        }
    };

    let technical_context = match obj.get("technical_context") {
        Some(v) if v.is_object() => {
            let ctx = TechnicalContext::from_value_lossy(Some(v));
            // Unparseable readings inside an object are dropped by the lossy parse.
            if serde_json::to_value(&ctx).ok().as_ref() != Some(v) {
                report.repaired_context += 1;
            }
            ctx
        }
        Some(_) => {
            report.repaired_context += 1;
            TechnicalContext::default()
        }
        None => TechnicalContext::default(),
    };

    let history = clean_history(entity_id, obj.get("history"), limits, now, report);

    Some(EntityLearningRecord {
        last_event_time,
        interval_ewma,
        interval_variance,
        event_count,
        threshold,
        last_health,
        history,
        technical_context,
    })
}

fn clean_history(
    entity_id: &str,
    raw: Option<&serde_json::Value>,
    limits: &LearningLimits,
    now: EpochSecs,
    report: &mut ValidationReport,
) -> Vec<HistoryEntry> {
    let entries = match raw {
        None | Some(serde_json::Value::Null) => return Vec::new(),
        Some(serde_json::Value::Array(entries)) => entries,
        Some(_) => {
            report.pruned_history += 1;
            return Vec::new();
        }
    };

    let cutoff = now - limits.max_history_age_secs();
    let original = entries.len();

    let mut history: Vec<HistoryEntry> = entries
        .iter()
        .filter_map(|e| serde_json::from_value::<HistoryEntry>(e.clone()).ok())
        .filter(|e| e.newest_timestamp() > cutoff)
        .collect();

    if history.len() > limits.max_history {
        let excess = history.len() - limits.max_history;
        history.drain(..excess);
    }

    let removed = original - history.len();
    if removed > 0 {
        tracing::debug!(
            entity_id = %entity_id,
            before = original,
            after = history.len(),
            "Cleaned entity history"
        );
        report.pruned_history += removed;
    }

    history
}

// ---------------------------------------------------------------------------
// Auxiliary operations
// ---------------------------------------------------------------------------

/// Drop entities that are not in `valid_ids`. Returns how many were removed.
pub fn orphan_cleanup(store: &mut LearningStore, valid_ids: &HashSet<EntityId>) -> usize {
    let before = store.len();
    store.retain(|id, _| valid_ids.contains(id));
    let removed = before - store.len();
    if removed > 0 {
        tracing::info!(removed, "Removed orphaned entities from learning state");
    }
    removed
}

/// Fold old history samples into a single leading aggregate.
///
/// The last `keep_last_n` entries are never touched. Of the rest, samples
/// older than `older_than_days` (and any earlier aggregate) are merged into
/// one [`HistoryAggregate`] placed at the front.
pub fn compress_history(
    store: &mut LearningStore,
    keep_last_n: usize,
    older_than_days: u32,
    now: EpochSecs,
) -> CompressionReport {
    let cutoff = now - f64::from(older_than_days) * SECS_PER_DAY;
    let mut report = CompressionReport::default();

    for (_, record) in store.iter_mut() {
        let split = record.history.len().saturating_sub(keep_last_n);
        let tail = record.history.split_off(split);
        let head = std::mem::take(&mut record.history);

        let mut aggregate: Option<HistoryAggregate> = None;
        let mut folded = 0usize;
        let mut kept = Vec::with_capacity(head.len());

        for entry in head {
            match entry {
                HistoryEntry::Aggregate(a) => merge_aggregate(&mut aggregate, a),
                HistoryEntry::Sample(s) if s.timestamp < cutoff => {
                    folded += 1;
                    merge_aggregate(
                        &mut aggregate,
                        HistoryAggregate {
                            compressed: true,
                            event_count: 1,
                            avg_interval: s.interval,
                            min_interval: s.interval,
                            max_interval: s.interval,
                            oldest_timestamp: s.timestamp,
                            newest_timestamp: s.timestamp,
                        },
                    );
                }
                sample => kept.push(sample),
            }
        }

        if folded > 0 {
            report.entities_compressed += 1;
            report.samples_compressed += folded;
        }

        record.history = aggregate
            .map(HistoryEntry::Aggregate)
            .into_iter()
            .chain(kept)
            .chain(tail)
            .collect();
    }

    if report.samples_compressed > 0 {
        tracing::info!(
            entities = report.entities_compressed,
            samples = report.samples_compressed,
            "History compressed"
        );
    }

    report
}

fn merge_aggregate(into: &mut Option<HistoryAggregate>, next: HistoryAggregate) {
    let Some(acc) = into.as_mut() else {
        *into = Some(next);
        return;
    };

    let total = acc.event_count + next.event_count;
    if total > 0 {
        acc.avg_interval = (acc.avg_interval * acc.event_count as f64
            + next.avg_interval * next.event_count as f64)
            / total as f64;
    }
    acc.event_count = total;
    acc.min_interval = acc.min_interval.min(next.min_interval);
    acc.max_interval = acc.max_interval.max(next.max_interval);
    acc.oldest_timestamp = acc.oldest_timestamp.min(next.oldest_timestamp);
    acc.newest_timestamp = acc.newest_timestamp.max(next.newest_timestamp);
}

/// Summarise a learning store for diagnostics.
pub fn data_stats(store: &LearningStore) -> DataStats {
    let mut stats = DataStats {
        entity_count: store.len(),
        total_events: 0,
        total_history_items: 0,
        oldest_event: None,
        newest_event: None,
    };

    for (_, record) in store.iter() {
        stats.total_events += record.event_count;
        stats.total_history_items += record.history.len();
        let t = record.last_event_time;
        stats.oldest_event = Some(stats.oldest_event.map_or(t, |o: f64| o.min(t)));
        stats.newest_event = Some(stats.newest_event.map_or(t, |n: f64| n.max(t)));
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: f64 = 10_000_000.0;

    fn limits() -> LearningLimits {
        LearningLimits {
            max_entities: 3,
            max_history: 4,
            max_history_age_days: 1,
        }
    }

    #[test]
    fn rejects_non_mapping() {
        let outcome = validate_and_clean(&json!([1, 2]), &limits(), NOW);
        assert!(!outcome.ok);
        assert!(outcome.store.is_empty());
    }

    #[test]
    fn drops_records_missing_required_fields() {
        let raw = json!({
            "sensor.ok": {"last_event": NOW, "event_count": 3},
            "sensor.no_count": {"last_event": NOW},
            "sensor.not_object": 42,
            "sensor.bad_time": {"last_event": "yesterday", "event_count": 1},
        });
        let outcome = validate_and_clean(&raw, &limits(), NOW);

        assert!(outcome.ok);
        assert_eq!(outcome.store.len(), 1);
        assert_eq!(outcome.report.dropped_records.len(), 3);
        assert!(outcome.message.contains("dropped 3 invalid records"));
    }

    #[test]
    fn coerces_numeric_fields() {
        let raw = json!({
            "sensor.a": {
                "last_event": "1000.5",
                "event_count": -4,
                "interval_ewma": "abc",
                "threshold": "75",
                "last_health": "zombie",
                "technical_context": null,
            }
        });
        let outcome = validate_and_clean(&raw, &limits(), NOW);
        let record = outcome.store.get("sensor.a").unwrap();

        assert_eq!(record.last_event_time, 1000.5);
        assert_eq!(record.event_count, 0);
        assert_eq!(record.interval_ewma, None);
        assert_eq!(record.threshold, Some(75.0));
        assert_eq!(record.last_health, HealthState::Unknown);
        assert_eq!(outcome.report.coerced_fields, 1);
        assert_eq!(outcome.report.reset_health, 1);
        assert_eq!(outcome.report.repaired_context, 1);
    }

    #[test]
    fn prunes_history_by_age_then_length() {
        let day = SECS_PER_DAY;
        let history: Vec<_> = (0..8)
            .map(|i| json!({"timestamp": NOW - 2.0 * day + f64::from(i) * day / 4.0, "interval": 10.0, "state": "on"}))
            .chain(std::iter::once(json!("garbage")))
            .collect();
        let raw = json!({"sensor.a": {"last_event": NOW, "event_count": 9, "history": history}});

        let outcome = validate_and_clean(&raw, &limits(), NOW);
        let record = outcome.store.get("sensor.a").unwrap();

        // 5 of 8 samples are at or before the 1-day cutoff; the junk entry is dropped.
        assert_eq!(record.history.len(), 3);
        assert!(record.history.iter().all(|e| e.newest_timestamp() > NOW - day));
        assert_eq!(outcome.report.pruned_history, 6);
    }

    #[test]
    fn size_cap_keeps_most_recent() {
        let raw = json!({
            "sensor.a": {"last_event": 1.0, "event_count": 1},
            "sensor.b": {"last_event": 5.0, "event_count": 1},
            "sensor.c": {"last_event": 3.0, "event_count": 1},
            "sensor.d": {"last_event": 4.0, "event_count": 1},
            "sensor.e": {"last_event": 2.0, "event_count": 1},
        });
        let outcome = validate_and_clean(&raw, &limits(), NOW);

        assert_eq!(outcome.report.pruned_entities, 2);
        let kept: Vec<_> = outcome.store.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(kept, vec!["sensor.b", "sensor.c", "sensor.d"]);
    }

    #[test]
    fn validation_is_idempotent() {
        let raw = json!({
            "sensor.a": {
                "last_event": NOW - 5.0,
                "event_count": "7",
                "interval_ewma": 12.5,
                "threshold": 31.25,
                "last_health": "ok",
                "history": [{"timestamp": NOW - 5.0, "interval": 12.0, "state": "on"}],
                "technical_context": {"battery_level": {"value": 50.0, "status": "ok", "updated_at": NOW}},
            },
            "sensor.b": {"last_event": NOW - 100.0, "event_count": 1, "last_health": "bogus"},
        });
        let first = validate_and_clean(&raw, &limits(), NOW);
        let second = validate_store(&first.store, &limits(), NOW);

        assert_eq!(first.store, second.store);
        assert!(second.report.is_clean(), "{:?}", second.report);
    }

    #[test]
    fn orphan_cleanup_removes_unknown_ids() {
        let mut store = LearningStore::new();
        store.insert("sensor.a".into(), EntityLearningRecord::baseline(1.0));
        store.insert("sensor.gone".into(), EntityLearningRecord::baseline(1.0));

        let valid: HashSet<EntityId> = ["sensor.a".to_string()].into_iter().collect();
        assert_eq!(orphan_cleanup(&mut store, &valid), 1);
        assert!(store.contains("sensor.a"));
        assert!(!store.contains("sensor.gone"));
    }

    #[test]
    fn compress_history_folds_old_samples() {
        let mut record = EntityLearningRecord::baseline(NOW);
        for (i, interval) in [10.0, 20.0, 30.0, 40.0, 50.0].into_iter().enumerate() {
            let ts = if i < 3 { NOW - 10.0 * SECS_PER_DAY + i as f64 } else { NOW - i as f64 };
            record.history.push(HistoryEntry::Sample(crate::learning::HistorySample {
                timestamp: ts,
                interval,
                state: "on".into(),
            }));
        }
        let mut store = LearningStore::new();
        store.insert("sensor.a".into(), record);

        let report = compress_history(&mut store, 1, 7, NOW);
        assert_eq!(report.samples_compressed, 3);

        let history = &store.get("sensor.a").unwrap().history;
        assert_eq!(history.len(), 3);
        match &history[0] {
            HistoryEntry::Aggregate(a) => {
                assert_eq!(a.event_count, 3);
                assert_eq!(a.avg_interval, 20.0);
                assert_eq!(a.min_interval, 10.0);
                assert_eq!(a.max_interval, 30.0);
                assert_eq!(a.oldest_timestamp, NOW - 10.0 * SECS_PER_DAY);
            }
            other => panic!("expected aggregate, got {other:?}"),
        }

        // Compressing again merges nothing new.
        let again = compress_history(&mut store, 1, 7, NOW);
        assert_eq!(again.samples_compressed, 0);
        assert_eq!(store.get("sensor.a").unwrap().history.len(), 3);
    }

    #[test]
    fn data_stats_summarise_store() {
        let mut store = LearningStore::new();
        let mut a = EntityLearningRecord::baseline(100.0);
        a.event_count = 4;
        let mut b = EntityLearningRecord::baseline(50.0);
        b.event_count = 2;
        store.insert("sensor.a".into(), a);
        store.insert("sensor.b".into(), b);

        let stats = data_stats(&store);
        assert_eq!(stats.entity_count, 2);
        assert_eq!(stats.total_events, 6);
        assert_eq!(stats.oldest_event, Some(50.0));
        assert_eq!(stats.newest_event, Some(100.0));
    }

    #[test]
    fn coercion_helpers() {
        assert_eq!(coerce_f64(&json!("3.5")), Some(3.5));
        assert_eq!(coerce_f64(&json!(true)), None);
        assert_eq!(coerce_count(&json!(5)), Some(5));
        assert_eq!(coerce_count(&json!(-2)), Some(0));
        assert_eq!(coerce_count(&json!(2.9)), Some(2));
        assert_eq!(coerce_count(&json!("x")), None);
    }
}
