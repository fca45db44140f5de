//! The guardian actor.
//!
//! [`Guardian`] is the single writer of learning state. It owns the
//! [`LearningStore`], the health cache, the save scheduler and the
//! persisted document, and runs in one tokio task. Everything else talks to
//! it through a cloneable [`GuardianHandle`] that sends
//! [`GuardianCommand`]s over an `mpsc` channel and awaits `oneshot`
//! replies.
//!
//! The run loop selects over:
//!
//! - incoming commands (state changes and queries),
//! - the debounced save deadline from [`SaveScheduler`],
//! - the backstop interval,
//! - a fixed one-minute health refresh,
//! - the configurable evaluation interval (`check_every_minutes`),
//! - a [`CancellationToken`] that triggers a final flush and exit.
//!
//! State changes enter through [`GuardianHandle::observe`], which waits
//! for room in the bounded channel instead of dropping events.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lastseen_core::config::{GuardianConfig, SECTION_LEARNING_STATE};
use lastseen_core::data_validator::{
    compress_history, data_stats, orphan_cleanup, validate_and_clean, validate_store,
    CompressionReport, DEFAULT_COMPRESS_KEEP_LAST, DEFAULT_COMPRESS_OLDER_THAN_DAYS,
};
use lastseen_core::error::CoreError;
use lastseen_core::health::{HealthState, HealthSummary};
use lastseen_core::health_cache::{
    CacheStats, HealthCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL_SECS,
};
use lastseen_core::learning::{
    EntityLearningRecord, HistoryEntry, LearningLimits, LearningStore, StateSample,
};
use lastseen_core::modes::Mode;
use lastseen_core::technical::TechnicalContext;
use lastseen_core::types::{now_secs, to_timestamp, validate_entity_id, EntityId, EpochSecs};
use lastseen_events::{EventBus, GuardianEvent, RemovalReason, StateChangedEvent};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::diagnostics::{
    self, Diagnostics, DiagnosticsExport, EntityDiagnostics, EntityOverview, SystemDiagnostics,
    GUARDIAN_VERSION,
};
use crate::error::{EngineError, EngineResult};
use crate::persistence::{PersistenceConfig, PersistenceStatus, SaveScheduler};
use crate::registry::{EntityMetadata, EntityRegistry};
use crate::storage::{DocumentStore, GuardianStorage};

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Fixed cadence of the health refresh, independent of
/// `check_every_minutes`.
pub const HEALTH_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Largest history page a caller may request.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// History page size when the caller does not ask for one.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Wall-clock source in epoch seconds.
pub type Clock = Arc<dyn Fn() -> EpochSecs + Send + Sync>;

type Reply<T> = oneshot::Sender<EngineResult<T>>;

// ---------------------------------------------------------------------------
// Options and reply types
// ---------------------------------------------------------------------------

/// Construction parameters for [`Guardian`].
#[derive(Clone)]
pub struct GuardianOptions {
    pub limits: LearningLimits,
    pub persistence: PersistenceConfig,
    pub cache_ttl_secs: f64,
    pub cache_capacity: usize,
    /// Where diagnostics land. Requested paths are resolved inside it.
    pub diagnostics_dir: PathBuf,
    /// Host entity registry; orphan cleanup is unavailable without one.
    pub registry: Option<Arc<dyn EntityRegistry>>,
    pub clock: Clock,
}

impl Default for GuardianOptions {
    fn default() -> Self {
        Self {
            limits: LearningLimits::standard(),
            persistence: PersistenceConfig::default(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            diagnostics_dir: PathBuf::from("."),
            registry: None,
            clock: Arc::new(now_secs),
        }
    }
}

/// Result of a full evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub results: BTreeMap<EntityId, HealthState>,
    pub summary: HealthSummary,
}

/// Result of a cleanup request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Entities removed because the host no longer knows them.
    pub orphans_removed: Option<usize>,
    /// Why orphan cleanup could not run.
    pub orphan_cleanup_error: Option<String>,
    pub compression: Option<CompressionReport>,
}

/// A page of an entity's history, most recent last.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityHistory {
    pub entity_id: EntityId,
    pub history: Vec<HistoryEntry>,
    pub count: usize,
}

/// What the notifier needs for one late or stale entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub last_event: EpochSecs,
    pub technical_context: TechnicalContext,
}

/// Point-in-time view used by the notification manager.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertSnapshot {
    pub now: EpochSecs,
    pub mode: Mode,
    pub enable_notifications: bool,
    pub notify_target: String,
    pub states: BTreeMap<EntityId, HealthState>,
    pub candidates: BTreeMap<EntityId, AlertCandidate>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Messages accepted by the guardian task.
#[derive(Debug)]
pub enum GuardianCommand {
    /// A host state change. Fire-and-forget.
    Observe(StateChangedEvent),
    EntityHealth {
        entity_id: EntityId,
        reply: Reply<HealthState>,
    },
    EntityStats {
        entity_id: EntityId,
        reply: Reply<Option<EntityLearningRecord>>,
    },
    AllHealthStates {
        reply: Reply<BTreeMap<EntityId, HealthState>>,
    },
    RunEvaluation {
        reply: Reply<EvaluationResult>,
    },
    ResetLearning {
        entity_id: Option<EntityId>,
        reply: Reply<usize>,
    },
    ExportDiagnostics {
        entity_id: Option<EntityId>,
        path: Option<PathBuf>,
        reply: Reply<DiagnosticsExport>,
    },
    CleanupData {
        remove_orphaned: bool,
        compress_history: bool,
        reply: Reply<CleanupReport>,
    },
    EntityHistory {
        entity_id: EntityId,
        limit: usize,
        reply: Reply<EntityHistory>,
    },
    Entities {
        reply: Reply<Vec<EntityOverview>>,
    },
    GetConfig {
        reply: Reply<GuardianConfig>,
    },
    SetConfig {
        partial: serde_json::Value,
        reply: Reply<GuardianConfig>,
    },
    SetMode {
        mode: Mode,
        reply: Reply<Mode>,
    },
    Summary {
        reply: Reply<HealthSummary>,
    },
    CacheStats {
        reply: Reply<CacheStats>,
    },
    PersistenceStatus {
        reply: Reply<PersistenceStatus>,
    },
    AlertSnapshot {
        reply: Reply<AlertSnapshot>,
    },
    Flush {
        reply: Reply<()>,
    },
}

// ---------------------------------------------------------------------------
// Guardian
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Debounce,
    Backstop,
    Requested,
    Shutdown,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Debounce => "debounce",
            Self::Backstop => "backstop",
            Self::Requested => "requested",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Owner of all learning state. See the module docs.
pub struct Guardian {
    store: LearningStore,
    cache: HealthCache,
    scheduler: SaveScheduler,
    storage: GuardianStorage,
    config: GuardianConfig,
    limits: LearningLimits,
    bus: Arc<EventBus>,
    registry: Option<Arc<dyn EntityRegistry>>,
    diagnostics_dir: PathBuf,
    clock: Clock,
}

impl Guardian {
    /// Load the persisted document and validate the learning state in it.
    pub async fn load(
        document_store: Arc<dyn DocumentStore>,
        bus: Arc<EventBus>,
        options: GuardianOptions,
    ) -> Self {
        let storage = GuardianStorage::load(document_store).await;
        let config = storage.config();
        if let Err(e) = config.check() {
            tracing::warn!(error = %e, "Stored config failed validation, keeping it as loaded");
        }

        let now = (options.clock)();
        let outcome = validate_and_clean(storage.learning_state(), &options.limits, now);
        if !outcome.ok {
            tracing::warn!(message = %outcome.message, "Learning state rejected, starting empty");
        } else if !outcome.report.is_clean() {
            tracing::info!(message = %outcome.message, "Learning state cleaned on load");
        }

        let mut store = outcome.store;
        store.rescale_thresholds(config.current_mode().threshold_multiplier());

        tracing::info!(
            entities = store.len(),
            mode = config.current_mode().as_str(),
            max_entities = options.limits.max_entities,
            "Guardian loaded"
        );

        Self {
            store,
            cache: HealthCache::new(options.cache_ttl_secs, options.cache_capacity),
            scheduler: SaveScheduler::new(options.persistence),
            storage,
            config,
            limits: options.limits,
            bus,
            registry: options.registry,
            diagnostics_dir: options.diagnostics_dir,
            clock: options.clock,
        }
    }

    /// Run the guardian on a new task.
    pub fn spawn(self, cancel: CancellationToken) -> (GuardianHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(rx, cancel));
        (GuardianHandle::from_sender(tx), task)
    }

    /// The actor loop. Returns after cancellation or once every handle is
    /// dropped, in both cases after a final flush.
    pub async fn run(mut self, mut rx: mpsc::Receiver<GuardianCommand>, cancel: CancellationToken) {
        let backstop_period = self.scheduler.config().backstop;
        let mut backstop = periodic(backstop_period);
        let mut refresh = periodic(HEALTH_REFRESH_INTERVAL);
        let mut evaluation_period = self.evaluation_period();
        let mut evaluation = periodic(evaluation_period);

        tracing::info!(
            backstop_secs = backstop_period.as_secs(),
            refresh_secs = HEALTH_REFRESH_INTERVAL.as_secs(),
            evaluation_secs = evaluation_period.as_secs(),
            "Guardian started"
        );

        loop {
            let deadline = self.scheduler.deadline();

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Guardian shutting down");
                    break;
                }
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        tracing::info!("All guardian handles dropped, stopping");
                        break;
                    }
                },
                _ = wait_until(deadline) => {
                    self.flush_logged(FlushReason::Debounce).await;
                }
                _ = backstop.tick() => {
                    if self.scheduler.backstop_due() {
                        self.flush_logged(FlushReason::Backstop).await;
                    }
                }
                _ = refresh.tick() => {
                    self.periodic_evaluation("refresh");
                }
                _ = evaluation.tick() => {
                    self.periodic_evaluation("check_interval");
                }
            }

            let period = self.evaluation_period();
            if period != evaluation_period {
                tracing::info!(evaluation_secs = period.as_secs(), "Evaluation interval changed");
                evaluation_period = period;
                evaluation = periodic(period);
            }
        }

        self.scheduler.take_pending();
        self.flush_logged(FlushReason::Shutdown).await;
        tracing::info!("Guardian stopped");
    }

    fn now(&self) -> EpochSecs {
        (self.clock)()
    }

    fn evaluation_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.global.check_every_minutes.max(1)) * 60)
    }

    async fn handle(&mut self, command: GuardianCommand) {
        match command {
            GuardianCommand::Observe(event) => self.observe(&event),
            GuardianCommand::EntityHealth { entity_id, reply } => {
                let _ = reply.send(Ok(self.entity_health(&entity_id)));
            }
            GuardianCommand::EntityStats { entity_id, reply } => {
                let _ = reply.send(Ok(self.store.get(&entity_id).cloned()));
            }
            GuardianCommand::AllHealthStates { reply } => {
                let _ = reply.send(Ok(self.store.health_states(self.now())));
            }
            GuardianCommand::RunEvaluation { reply } => {
                let _ = reply.send(Ok(self.run_evaluation()));
            }
            GuardianCommand::ResetLearning { entity_id, reply } => {
                let _ = reply.send(self.reset_learning(entity_id).await);
            }
            GuardianCommand::ExportDiagnostics {
                entity_id,
                path,
                reply,
            } => {
                let _ = reply.send(self.export_diagnostics(entity_id, path).await);
            }
            GuardianCommand::CleanupData {
                remove_orphaned,
                compress_history,
                reply,
            } => {
                let _ = reply.send(Ok(self.cleanup_data(remove_orphaned, compress_history).await));
            }
            GuardianCommand::EntityHistory {
                entity_id,
                limit,
                reply,
            } => {
                let _ = reply.send(self.entity_history(entity_id, limit));
            }
            GuardianCommand::Entities { reply } => {
                let now = self.now();
                let _ = reply.send(Ok(self.entity_overviews(now).await));
            }
            GuardianCommand::GetConfig { reply } => {
                let _ = reply.send(Ok(self.config.clone()));
            }
            GuardianCommand::SetConfig { partial, reply } => {
                let _ = reply.send(self.set_config(&partial).await);
            }
            GuardianCommand::SetMode { mode, reply } => {
                let _ = reply.send(self.set_mode(mode).await);
            }
            GuardianCommand::Summary { reply } => {
                let states = self.store.health_states(self.now());
                let _ = reply.send(Ok(HealthSummary::from_states(&states)));
            }
            GuardianCommand::CacheStats { reply } => {
                let _ = reply.send(Ok(self.cache.stats()));
            }
            GuardianCommand::PersistenceStatus { reply } => {
                let _ = reply.send(Ok(self.scheduler.status(Instant::now())));
            }
            GuardianCommand::AlertSnapshot { reply } => {
                let _ = reply.send(Ok(self.alert_snapshot()));
            }
            GuardianCommand::Flush { reply } => {
                self.scheduler.take_pending();
                let _ = reply.send(self.flush(FlushReason::Requested).await);
            }
        }
    }

    // -- learning -----------------------------------------------------------

    fn observe(&mut self, event: &StateChangedEvent) {
        if let Err(e) = validate_entity_id(&event.entity_id) {
            tracing::debug!(error = %e, "Ignoring state change with invalid entity id");
            return;
        }

        let sample = StateSample {
            entity_id: &event.entity_id,
            timestamp: event.timestamp,
            state: &event.state,
            attributes: &event.attributes,
        };
        let multiplier = self.config.current_mode().threshold_multiplier();
        let observation = self.store.observe(sample, multiplier, self.limits.max_history);

        self.cache.invalidate(&event.entity_id);
        self.scheduler.mark_changed(&event.entity_id);

        if observation.created && self.store.len() > self.limits.max_entities {
            let evicted = self.store.enforce_capacity(self.limits.max_entities);
            for id in &evicted {
                self.cache.invalidate(id);
                self.bus
                    .publish_guardian(GuardianEvent::entity_removed(id, RemovalReason::Evicted));
            }
            tracing::warn!(
                evicted = evicted.len(),
                max_entities = self.limits.max_entities,
                "Entity limit reached, evicted least recently active entities"
            );
        }

        if let Some(record) = self.store.get(&event.entity_id) {
            if observation.health_changed() {
                tracing::info!(
                    entity_id = %event.entity_id,
                    from = observation.previous_health.as_str(),
                    to = observation.health.as_str(),
                    "Entity health changed"
                );
                self.bus.publish_guardian(GuardianEvent::health_changed(
                    &event.entity_id,
                    observation.previous_health,
                    observation.health,
                    record,
                ));
            }
            if observation.learned {
                if let Some(ewma) = record.interval_ewma {
                    self.bus.publish_guardian(GuardianEvent::entity_learned(
                        &event.entity_id,
                        ewma,
                        record.event_count,
                    ));
                }
            }
        }

        self.scheduler.schedule(observation.is_priority(), Instant::now());
    }

    fn periodic_evaluation(&mut self, trigger: &'static str) {
        let result = self.run_evaluation();
        let expired = self.cache.cleanup_expired(self.now());
        tracing::debug!(
            trigger,
            entities = result.results.len(),
            problems = result.summary.late + result.summary.stale,
            expired_cache_entries = expired,
            "Periodic evaluation complete"
        );
    }

    fn entity_health(&mut self, entity_id: &str) -> HealthState {
        let now = self.now();
        if let Some(health) = self.cache.get(entity_id, now) {
            return health;
        }
        let health = self.store.classify(entity_id, now).unwrap_or_default();
        self.cache.set(entity_id, health, now);
        health
    }

    fn run_evaluation(&mut self) -> EvaluationResult {
        let now = self.now();
        let report = self.store.evaluate_all(now);

        self.cache.invalidate_all();
        for (entity_id, health) in &report.states {
            self.cache.set(entity_id, *health, now);
        }

        for transition in &report.transitions {
            self.scheduler.mark_changed(&transition.entity_id);
            if let Some(record) = self.store.get(&transition.entity_id) {
                self.bus.publish_guardian(GuardianEvent::health_changed(
                    &transition.entity_id,
                    transition.from,
                    transition.to,
                    record,
                ));
            }
        }
        if !report.transitions.is_empty() {
            tracing::info!(transitions = report.transitions.len(), "Evaluation changed entity health");
            self.scheduler
                .schedule(report.has_priority_transition(), Instant::now());
        }

        EvaluationResult {
            summary: HealthSummary::from_states(&report.states),
            results: report.states,
        }
    }

    async fn reset_learning(&mut self, entity_id: Option<EntityId>) -> EngineResult<usize> {
        let removed = match entity_id {
            Some(id) => {
                if self.store.remove(&id).is_none() {
                    return Err(CoreError::NotFound {
                        entity: "Entity",
                        id,
                    }
                    .into());
                }
                self.cache.invalidate(&id);
                self.scheduler.mark_changed(&id);
                self.bus
                    .publish_guardian(GuardianEvent::entity_removed(&id, RemovalReason::Reset));
                tracing::info!(entity_id = %id, "Learning reset for entity");
                1
            }
            None => {
                let ids: Vec<EntityId> = self.store.iter().map(|(id, _)| id.clone()).collect();
                self.store.clear();
                self.cache.invalidate_all();
                for id in &ids {
                    self.scheduler.mark_changed(id);
                    self.bus
                        .publish_guardian(GuardianEvent::entity_removed(id, RemovalReason::Reset));
                }
                tracing::info!(removed = ids.len(), "Learning reset for all entities");
                ids.len()
            }
        };

        self.scheduler.take_pending();
        self.flush_logged(FlushReason::Requested).await;
        Ok(removed)
    }

    fn entity_history(&self, entity_id: EntityId, limit: usize) -> EngineResult<EntityHistory> {
        if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
            return Err(CoreError::Validation(format!(
                "limit must be between 1 and {MAX_HISTORY_LIMIT}"
            ))
            .into());
        }

        let history: Vec<HistoryEntry> = self
            .store
            .get(&entity_id)
            .map(|record| {
                let skip = record.history.len().saturating_sub(limit);
                record.history[skip..].to_vec()
            })
            .unwrap_or_default();

        Ok(EntityHistory {
            entity_id,
            count: history.len(),
            history,
        })
    }

    // -- config -------------------------------------------------------------

    async fn set_config(&mut self, partial: &serde_json::Value) -> EngineResult<GuardianConfig> {
        let updated = self.config.merged_with(partial)?;
        self.storage.set_config(&updated).await?;

        let previous_mode = self.config.current_mode();
        self.config = updated;
        if self.config.current_mode() != previous_mode {
            self.apply_mode();
        }

        tracing::info!("Configuration updated");
        Ok(self.config.clone())
    }

    async fn set_mode(&mut self, mode: Mode) -> EngineResult<Mode> {
        let mut updated = self.config.clone();
        updated.modes.current = mode.as_str().to_string();
        self.storage.set_config(&updated).await?;

        self.config = updated;
        self.apply_mode();
        tracing::info!(mode = mode.as_str(), "Mode changed");
        Ok(mode)
    }

    /// Rescale every threshold for the current mode and persist them.
    fn apply_mode(&mut self) {
        let multiplier = self.config.current_mode().threshold_multiplier();
        self.store.rescale_thresholds(multiplier);
        self.cache.invalidate_all();

        for (id, _) in self.store.iter() {
            self.scheduler.mark_changed(id);
        }
        if !self.store.is_empty() {
            self.scheduler.schedule(false, Instant::now());
        }
    }

    // -- maintenance --------------------------------------------------------

    async fn cleanup_data(&mut self, remove_orphaned: bool, compress: bool) -> CleanupReport {
        let mut report = CleanupReport::default();
        let now = self.now();

        if remove_orphaned {
            match &self.registry {
                Some(registry) => match registry.entity_ids().await {
                    Ok(valid) => {
                        let before: HashSet<EntityId> =
                            self.store.iter().map(|(id, _)| id.clone()).collect();
                        let removed = orphan_cleanup(&mut self.store, &valid);
                        for id in before.iter().filter(|id| !self.store.contains(id)) {
                            self.cache.invalidate(id);
                            self.scheduler.mark_changed(id);
                            self.bus.publish_guardian(GuardianEvent::entity_removed(
                                id,
                                RemovalReason::Orphaned,
                            ));
                        }
                        report.orphans_removed = Some(removed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Entity registry unavailable, skipping orphan cleanup");
                        report.orphan_cleanup_error = Some(e.to_string());
                    }
                },
                None => {
                    report.orphan_cleanup_error = Some("no entity registry configured".to_string());
                }
            }
        }

        if compress {
            let compression = compress_history(
                &mut self.store,
                DEFAULT_COMPRESS_KEEP_LAST,
                DEFAULT_COMPRESS_OLDER_THAN_DAYS,
                now,
            );
            if compression.entities_compressed > 0 {
                for (id, _) in self.store.iter() {
                    self.scheduler.mark_changed(id);
                }
            }
            report.compression = Some(compression);
        }

        self.scheduler.take_pending();
        self.flush_logged(FlushReason::Requested).await;
        report
    }

    // -- diagnostics --------------------------------------------------------

    async fn export_diagnostics(
        &mut self,
        entity_id: Option<EntityId>,
        path: Option<PathBuf>,
    ) -> EngineResult<DiagnosticsExport> {
        let now = self.now();
        let at = to_timestamp(now).unwrap_or_else(Utc::now);

        let diagnostics = match &entity_id {
            Some(id) => {
                let record = self.store.get(id).cloned().ok_or_else(|| CoreError::NotFound {
                    entity: "Entity",
                    id: id.clone(),
                })?;
                let metadata = self.find_metadata(id).await;
                Diagnostics::Entity(Box::new(EntityDiagnostics {
                    entity_id: id.clone(),
                    timestamp: at,
                    health: record.classify(now),
                    stats: record,
                    metadata,
                }))
            }
            None => {
                let states = self.store.health_states(now);
                Diagnostics::System(Box::new(SystemDiagnostics {
                    version: GUARDIAN_VERSION,
                    timestamp: at,
                    config: self.config.clone(),
                    data_stats: data_stats(&self.store),
                    health_summary: HealthSummary::from_states(&states),
                    storage: self.storage.stats(),
                    persistence: self.scheduler.status(Instant::now()),
                    cache: self.cache.stats(),
                    entities: self.entity_overviews(now).await,
                }))
            }
        };

        let path = match path {
            Some(requested) => diagnostics::resolve_path(&self.diagnostics_dir, &requested)?,
            None => diagnostics::default_path(&self.diagnostics_dir, entity_id.as_deref(), at),
        };
        diagnostics::write(&path, &diagnostics).await?;
        Ok(DiagnosticsExport { path, diagnostics })
    }

    async fn find_metadata(&self, entity_id: &str) -> Option<EntityMetadata> {
        let registry = self.registry.as_ref()?;
        match registry.find(entity_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, entity_id, "Entity registry lookup failed");
                None
            }
        }
    }

    /// Every entity known to the registry or the learning store.
    async fn entity_overviews(&self, now: EpochSecs) -> Vec<EntityOverview> {
        let mut metadata: BTreeMap<EntityId, EntityMetadata> = BTreeMap::new();
        if let Some(registry) = &self.registry {
            match registry.entities().await {
                Ok(entities) => {
                    metadata.extend(entities.into_iter().map(|m| (m.entity_id.clone(), m)));
                }
                Err(e) => tracing::warn!(error = %e, "Entity registry unavailable"),
            }
        }

        let mut ids: BTreeSet<EntityId> = metadata.keys().cloned().collect();
        ids.extend(self.store.iter().map(|(id, _)| id.clone()));

        ids.into_iter()
            .map(|id| {
                let stats = self.store.get(&id).cloned();
                EntityOverview {
                    health: stats.as_ref().map_or(HealthState::Unknown, |r| r.classify(now)),
                    metadata: metadata.remove(&id),
                    stats,
                    entity_id: id,
                }
            })
            .collect()
    }

    fn alert_snapshot(&self) -> AlertSnapshot {
        let now = self.now();
        let states = self.store.health_states(now);
        let candidates = states
            .iter()
            .filter(|(_, health)| health.is_problem())
            .filter_map(|(id, _)| {
                self.store.get(id).map(|record| {
                    (
                        id.clone(),
                        AlertCandidate {
                            last_event: record.last_event_time,
                            technical_context: record.technical_context.clone(),
                        },
                    )
                })
            })
            .collect();

        AlertSnapshot {
            now,
            mode: self.config.current_mode(),
            enable_notifications: self.config.global.enable_notifications,
            notify_target: self.config.global.notify_target.clone(),
            states,
            candidates,
        }
    }

    // -- persistence --------------------------------------------------------

    /// Validate the store, replace it with the cleaned copy and save.
    ///
    /// On failure the changed set is kept so the next deadline or backstop
    /// retries.
    async fn flush(&mut self, reason: FlushReason) -> EngineResult<()> {
        self.scheduler.take_pending();
        let flushed = self.scheduler.changed_snapshot();

        let outcome = validate_store(&self.store, &self.limits, self.now());
        if !outcome.report.is_clean() {
            tracing::info!(message = %outcome.message, "Learning state cleaned before save");
            self.cache.invalidate_all();
        }
        self.store = outcome.store;

        let saved = match serde_json::to_value(&self.store) {
            Ok(value) => {
                self.storage.set_section(SECTION_LEARNING_STATE, value);
                self.storage.save().await
            }
            Err(e) => Err(EngineError::from(e)),
        };

        match saved {
            Ok(()) => {
                self.scheduler.on_flush_success(&flushed, Instant::now());
                tracing::debug!(
                    reason = reason.as_str(),
                    entities = self.store.len(),
                    changed = flushed.len(),
                    "Learning state flushed"
                );
                Ok(())
            }
            Err(e) => {
                self.scheduler.on_flush_failure();
                Err(e)
            }
        }
    }

    async fn flush_logged(&mut self, reason: FlushReason) {
        if let Err(e) = self.flush(reason).await {
            tracing::error!(
                error = %e,
                reason = reason.as_str(),
                pending_changes = self.scheduler.changed_count(),
                "Failed to flush learning state"
            );
        }
    }
}

/// An interval whose first tick is one period from now.
fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// GuardianHandle
// ---------------------------------------------------------------------------

/// Cloneable client for the guardian task.
#[derive(Clone)]
pub struct GuardianHandle {
    tx: mpsc::Sender<GuardianCommand>,
}

fn stopped() -> EngineError {
    EngineError::Unavailable("guardian is not running".to_string())
}

impl GuardianHandle {
    pub(crate) fn from_sender(tx: mpsc::Sender<GuardianCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> GuardianCommand,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Queue a state change for learning. Waits while the channel is full.
    pub async fn observe(&self, event: StateChangedEvent) -> EngineResult<()> {
        self.tx
            .send(GuardianCommand::Observe(event))
            .await
            .map_err(|_| stopped())
    }

    pub async fn entity_health(&self, entity_id: &str) -> EngineResult<HealthState> {
        self.request(|reply| GuardianCommand::EntityHealth {
            entity_id: entity_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn entity_stats(&self, entity_id: &str) -> EngineResult<Option<EntityLearningRecord>> {
        self.request(|reply| GuardianCommand::EntityStats {
            entity_id: entity_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn all_health_states(&self) -> EngineResult<BTreeMap<EntityId, HealthState>> {
        self.request(|reply| GuardianCommand::AllHealthStates { reply })
            .await
    }

    /// Re-classify every entity now, publishing transitions.
    pub async fn run_evaluation(&self) -> EngineResult<EvaluationResult> {
        self.request(|reply| GuardianCommand::RunEvaluation { reply })
            .await
    }

    /// Forget one entity (or all with `None`) and persist immediately.
    /// Returns how many records were removed.
    pub async fn reset_learning(&self, entity_id: Option<&str>) -> EngineResult<usize> {
        self.request(|reply| GuardianCommand::ResetLearning {
            entity_id: entity_id.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn export_diagnostics(
        &self,
        entity_id: Option<&str>,
        path: Option<PathBuf>,
    ) -> EngineResult<DiagnosticsExport> {
        self.request(|reply| GuardianCommand::ExportDiagnostics {
            entity_id: entity_id.map(str::to_string),
            path,
            reply,
        })
        .await
    }

    pub async fn cleanup_data(
        &self,
        remove_orphaned: bool,
        compress_history: bool,
    ) -> EngineResult<CleanupReport> {
        self.request(|reply| GuardianCommand::CleanupData {
            remove_orphaned,
            compress_history,
            reply,
        })
        .await
    }

    pub async fn entity_history(&self, entity_id: &str, limit: usize) -> EngineResult<EntityHistory> {
        self.request(|reply| GuardianCommand::EntityHistory {
            entity_id: entity_id.to_string(),
            limit,
            reply,
        })
        .await
    }

    pub async fn entities(&self) -> EngineResult<Vec<EntityOverview>> {
        self.request(|reply| GuardianCommand::Entities { reply }).await
    }

    pub async fn config(&self) -> EngineResult<GuardianConfig> {
        self.request(|reply| GuardianCommand::GetConfig { reply }).await
    }

    /// Deep-merge `partial` into the config, validate and persist it.
    pub async fn set_config(&self, partial: serde_json::Value) -> EngineResult<GuardianConfig> {
        self.request(|reply| GuardianCommand::SetConfig { partial, reply })
            .await
    }

    pub async fn set_mode(&self, mode: Mode) -> EngineResult<Mode> {
        self.request(|reply| GuardianCommand::SetMode { mode, reply })
            .await
    }

    pub async fn summary(&self) -> EngineResult<HealthSummary> {
        self.request(|reply| GuardianCommand::Summary { reply }).await
    }

    pub async fn cache_stats(&self) -> EngineResult<CacheStats> {
        self.request(|reply| GuardianCommand::CacheStats { reply })
            .await
    }

    pub async fn persistence_status(&self) -> EngineResult<PersistenceStatus> {
        self.request(|reply| GuardianCommand::PersistenceStatus { reply })
            .await
    }

    pub async fn alert_snapshot(&self) -> EngineResult<AlertSnapshot> {
        self.request(|reply| GuardianCommand::AlertSnapshot { reply })
            .await
    }

    /// Save now, bypassing the debounce.
    pub async fn flush(&self) -> EngineResult<()> {
        self.request(|reply| GuardianCommand::Flush { reply }).await
    }
}
