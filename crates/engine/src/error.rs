//! Engine error types.
//!
//! [`EngineError`] covers failures inside the guardian and its
//! collaborators. [`CommandError`] is what the command surface hands back
//! to callers: a stable machine-readable code plus a message.

use lastseen_core::error::CoreError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A domain-level error from `lastseen_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The document store rejected a load or save.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The guardian task is not running or a collaborator is missing.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limit exceeded for connection {connection_id}")]
    RateLimited { connection_id: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

// ---------------------------------------------------------------------------
// CommandError
// ---------------------------------------------------------------------------

pub const CODE_NOT_FOUND: &str = "not_found";
pub const CODE_INVALID_INPUT: &str = "invalid_input";
pub const CODE_RATE_LIMITED: &str = "rate_limit_exceeded";
pub const CODE_NOT_READY: &str = "not_ready";
pub const CODE_ERROR: &str = "error";

/// Error returned to command callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CommandError {
    pub code: &'static str,
    pub message: String,
}

impl CommandError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_INPUT, message)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<EngineError> for CommandError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::Core(CoreError::NotFound { .. }) => Self::new(CODE_NOT_FOUND, err.to_string()),
            EngineError::Core(CoreError::Validation(msg)) => Self::new(CODE_INVALID_INPUT, msg.clone()),
            EngineError::Unavailable(msg) => Self::new(CODE_NOT_READY, msg.clone()),
            EngineError::RateLimited { .. } => Self::new(
                CODE_RATE_LIMITED,
                "Rate limit exceeded. Please slow down your requests.",
            ),
            EngineError::Core(CoreError::Internal(_))
            | EngineError::Storage(_)
            | EngineError::Io(_)
            | EngineError::Serialization(_) => {
                tracing::error!(error = %err, "Command failed");
                Self::new(CODE_ERROR, err.to_string())
            }
        }
    }
}

impl From<CoreError> for CommandError {
    fn from(err: CoreError) -> Self {
        EngineError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_stable_codes() {
        let not_found: CommandError = EngineError::Core(CoreError::NotFound {
            entity: "Entity",
            id: "sensor.a".into(),
        })
        .into();
        assert_eq!(not_found.code(), CODE_NOT_FOUND);

        let invalid: CommandError = CoreError::Validation("bad mode".into()).into();
        assert_eq!(invalid.code(), CODE_INVALID_INPUT);
        assert_eq!(invalid.message, "bad mode");

        let limited: CommandError = EngineError::RateLimited {
            connection_id: "c1".into(),
        }
        .into();
        assert_eq!(limited.code(), CODE_RATE_LIMITED);

        let not_ready: CommandError = EngineError::Unavailable("guardian stopped".into()).into();
        assert_eq!(not_ready.code(), CODE_NOT_READY);

        let storage: CommandError = EngineError::Storage("disk full".into()).into();
        assert_eq!(storage.code(), CODE_ERROR);
    }
}
