//! Command surface.
//!
//! Callers submit a [`CommandRequest`] (a connection id plus a parsed
//! [`Command`]). The [`CommandRouter`] runs it through an ordered chain of
//! [`Interceptor`]s (rate limiting, input validation) and only then
//! dispatches to the guardian. A rejected command never reaches the writer.
//!
//! Commands arrive as JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "get_entity_history", "entity_id": "sensor.door", "limit": 20}
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lastseen_core::modes::Mode;
use lastseen_core::rate_limit::{RateLimiter, RATE_LIMIT_MAX_CALLS, RATE_LIMIT_WINDOW_SECS};
use lastseen_core::types::{now_secs, validate_entity_id};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::diagnostics::check_relative;
use crate::error::{CommandError, EngineError};
use crate::guardian::{Clock, GuardianHandle, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

/// Every command the guardian answers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    GetEntityHealth {
        entity_id: String,
    },
    GetEntityStats {
        entity_id: String,
    },
    GetAllHealthStates,
    RunEvaluation,
    /// Without an entity id, learning is reset for every entity.
    ResetLearning {
        #[serde(default)]
        entity_id: Option<String>,
    },
    ExportDiagnostics {
        #[serde(default)]
        entity_id: Option<String>,
        #[serde(default)]
        path: Option<PathBuf>,
    },
    CleanupData {
        #[serde(default = "default_true")]
        remove_orphaned: bool,
        #[serde(default = "default_true")]
        compress_history: bool,
    },
    GetEntityHistory {
        entity_id: String,
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
    GetEntities,
    GetConfig,
    SetConfig {
        config: serde_json::Value,
    },
    SetMode {
        mode: String,
    },
    GetSummary,
    GetCacheStats,
    GetPersistenceStatus,
}

impl Command {
    /// Wire name, as found in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetEntityHealth { .. } => "get_entity_health",
            Self::GetEntityStats { .. } => "get_entity_stats",
            Self::GetAllHealthStates => "get_all_health_states",
            Self::RunEvaluation => "run_evaluation",
            Self::ResetLearning { .. } => "reset_learning",
            Self::ExportDiagnostics { .. } => "export_diagnostics",
            Self::CleanupData { .. } => "cleanup_data",
            Self::GetEntityHistory { .. } => "get_entity_history",
            Self::GetEntities => "get_entities",
            Self::GetConfig => "get_config",
            Self::SetConfig { .. } => "set_config",
            Self::SetMode { .. } => "set_mode",
            Self::GetSummary => "get_summary",
            Self::GetCacheStats => "get_cache_stats",
            Self::GetPersistenceStatus => "get_persistence_status",
        }
    }

    /// Whether the command changes guardian state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::RunEvaluation
                | Self::ResetLearning { .. }
                | Self::CleanupData { .. }
                | Self::SetConfig { .. }
                | Self::SetMode { .. }
        )
    }

    /// Check argument shapes without touching guardian state.
    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            Self::GetEntityHealth { entity_id }
            | Self::GetEntityStats { entity_id } => validate_entity_id(entity_id)?,
            Self::ResetLearning { entity_id } => {
                if let Some(id) = entity_id {
                    validate_entity_id(id)?;
                }
            }
            Self::ExportDiagnostics { entity_id, path } => {
                if let Some(id) = entity_id {
                    validate_entity_id(id)?;
                }
                if let Some(path) = path {
                    check_relative(path)?;
                }
            }
            Self::GetEntityHistory { entity_id, limit } => {
                validate_entity_id(entity_id)?;
                if !(1..=MAX_HISTORY_LIMIT).contains(limit) {
                    return Err(CommandError::invalid_input(format!(
                        "limit must be between 1 and {MAX_HISTORY_LIMIT}"
                    )));
                }
            }
            Self::SetConfig { config } => {
                if !config.is_object() {
                    return Err(CommandError::invalid_input("config must be an object"));
                }
            }
            Self::SetMode { mode } => {
                Mode::from_str(mode)?;
            }
            Self::GetAllHealthStates
            | Self::RunEvaluation
            | Self::CleanupData { .. }
            | Self::GetEntities
            | Self::GetConfig
            | Self::GetSummary
            | Self::GetCacheStats
            | Self::GetPersistenceStatus => {}
        }
        Ok(())
    }
}

/// A command together with the connection that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub connection_id: String,
    pub command: Command,
}

impl CommandRequest {
    pub fn new(connection_id: impl Into<String>, command: Command) -> Self {
        Self {
            connection_id: connection_id.into(),
            command,
        }
    }

    /// Parse a JSON command object.
    pub fn from_json(
        connection_id: impl Into<String>,
        raw: serde_json::Value,
    ) -> Result<Self, CommandError> {
        let command = serde_json::from_value(raw)
            .map_err(|e| CommandError::invalid_input(format!("Malformed command: {e}")))?;
        Ok(Self::new(connection_id, command))
    }
}

// ---------------------------------------------------------------------------
// Interceptors
// ---------------------------------------------------------------------------

/// A check run before a command is dispatched. Returning an error stops
/// the chain.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(&self, request: &CommandRequest) -> Result<(), CommandError>;

    /// Called once a connection has closed.
    async fn disconnect(&self, _connection_id: &str) {}
}

/// Sliding-window rate limit per connection.
pub struct RateLimitInterceptor {
    limiter: Mutex<RateLimiter>,
    clock: Clock,
}

impl RateLimitInterceptor {
    pub fn new(window_secs: f64, max_calls: usize, clock: Clock) -> Self {
        Self {
            limiter: Mutex::new(RateLimiter::new(window_secs, max_calls)),
            clock,
        }
    }
}

impl Default for RateLimitInterceptor {
    fn default() -> Self {
        Self::new(RATE_LIMIT_WINDOW_SECS, RATE_LIMIT_MAX_CALLS, Arc::new(now_secs))
    }
}

#[async_trait]
impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before(&self, request: &CommandRequest) -> Result<(), CommandError> {
        let now = (self.clock)();
        let decision = self
            .limiter
            .lock()
            .await
            .check(&request.connection_id, request.command.name(), now);

        if !decision.allowed {
            return Err(EngineError::RateLimited {
                connection_id: request.connection_id.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str) {
        let mut limiter = self.limiter.lock().await;
        limiter.reset(connection_id);
        tracing::debug!(
            connection_id = %connection_id,
            tracked_connections = limiter.tracked_connections(),
            "Rate limit window released"
        );
    }
}

/// Rejects malformed arguments.
pub struct ValidationInterceptor;

#[async_trait]
impl Interceptor for ValidationInterceptor {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn before(&self, request: &CommandRequest) -> Result<(), CommandError> {
        request.command.validate()
    }
}

// ---------------------------------------------------------------------------
// CommandRouter
// ---------------------------------------------------------------------------

/// Runs the interceptor chain and dispatches to the guardian.
#[derive(Clone)]
pub struct CommandRouter {
    handle: GuardianHandle,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

/// Response body of a successful command.
pub type CommandResponse = serde_json::Value;

fn to_json<T: Serialize>(value: &T) -> Result<CommandResponse, CommandError> {
    serde_json::to_value(value).map_err(|e| EngineError::from(e).into())
}

impl CommandRouter {
    /// Router with the default chain: rate limit, then validation.
    pub fn new(handle: GuardianHandle) -> Self {
        Self::with_interceptors(
            handle,
            vec![
                Arc::new(RateLimitInterceptor::default()),
                Arc::new(ValidationInterceptor),
            ],
        )
    }

    pub fn with_interceptors(handle: GuardianHandle, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            handle,
            interceptors,
        }
    }

    /// Parse and dispatch a raw JSON command.
    pub async fn dispatch_json(
        &self,
        connection_id: &str,
        raw: serde_json::Value,
    ) -> Result<CommandResponse, CommandError> {
        let request = CommandRequest::from_json(connection_id, raw)?;
        self.dispatch(&request).await
    }

    /// Tell every interceptor that `connection_id` is gone.
    pub async fn disconnect(&self, connection_id: &str) {
        for interceptor in &self.interceptors {
            interceptor.disconnect(connection_id).await;
        }
    }

    pub async fn dispatch(&self, request: &CommandRequest) -> Result<CommandResponse, CommandError> {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.before(request).await {
                tracing::debug!(
                    connection_id = %request.connection_id,
                    command = request.command.name(),
                    interceptor = interceptor.name(),
                    code = e.code(),
                    "Command rejected"
                );
                return Err(e);
            }
        }

        if request.command.is_mutating() {
            tracing::info!(
                connection_id = %request.connection_id,
                command = request.command.name(),
                "Dispatching command"
            );
        }

        self.execute(&request.command).await
    }

    async fn execute(&self, command: &Command) -> Result<CommandResponse, CommandError> {
        let handle = &self.handle;

        match command {
            Command::GetEntityHealth { entity_id } => {
                let health = handle.entity_health(entity_id).await?;
                Ok(json!({ "entity_id": entity_id, "health": health }))
            }
            Command::GetEntityStats { entity_id } => {
                let stats = handle.entity_stats(entity_id).await?.ok_or_else(|| {
                    CommandError::new(
                        crate::error::CODE_NOT_FOUND,
                        format!("No learning data for {entity_id}"),
                    )
                })?;
                Ok(json!({ "entity_id": entity_id, "stats": to_json(&stats)? }))
            }
            Command::GetAllHealthStates => {
                let states = handle.all_health_states().await?;
                Ok(json!({ "states": to_json(&states)? }))
            }
            Command::RunEvaluation => to_json(&handle.run_evaluation().await?),
            Command::ResetLearning { entity_id } => {
                let reset = handle.reset_learning(entity_id.as_deref()).await?;
                Ok(json!({ "success": true, "reset": reset }))
            }
            Command::ExportDiagnostics { entity_id, path } => {
                let export = handle
                    .export_diagnostics(entity_id.as_deref(), path.clone())
                    .await?;
                Ok(json!({
                    "success": true,
                    "path": export.path,
                    "diagnostics": to_json(&export.diagnostics)?,
                }))
            }
            Command::CleanupData {
                remove_orphaned,
                compress_history,
            } => {
                let report = handle.cleanup_data(*remove_orphaned, *compress_history).await?;
                Ok(json!({ "success": true, "report": to_json(&report)? }))
            }
            Command::GetEntityHistory { entity_id, limit } => {
                to_json(&handle.entity_history(entity_id, *limit).await?)
            }
            Command::GetEntities => {
                let entities = handle.entities().await?;
                Ok(json!({ "entities": to_json(&entities)? }))
            }
            Command::GetConfig => {
                let config = handle.config().await?;
                Ok(json!({ "config": to_json(&config)? }))
            }
            Command::SetConfig { config } => {
                let updated = handle.set_config(config.clone()).await?;
                Ok(json!({ "success": true, "config": to_json(&updated)? }))
            }
            Command::SetMode { mode } => {
                let mode = handle.set_mode(Mode::from_str(mode)?).await?;
                Ok(json!({ "success": true, "mode": mode }))
            }
            Command::GetSummary => to_json(&handle.summary().await?),
            Command::GetCacheStats => to_json(&handle.cache_stats().await?),
            Command::GetPersistenceStatus => to_json(&handle.persistence_status().await?),
        }
    }
}
