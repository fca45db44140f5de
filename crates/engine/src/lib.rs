//! Last Seen Guardian runtime.
//!
//! Wires the pure domain logic of `lastseen_core` to storage, timers and
//! callers:
//!
//! - [`guardian`]: the single-writer actor owning all learning state.
//! - [`persistence`]: debounce / priority / backstop save scheduling.
//! - [`storage`]: the persisted document and its backends.
//! - [`commands`]: the command surface and its interceptor chain.
//! - [`notifier`]: periodic late/stale notifications.
//! - [`registry`], [`diagnostics`], [`panel`]: host integration.

pub mod commands;
pub mod diagnostics;
pub mod error;
pub mod guardian;
pub mod notifier;
pub mod panel;
pub mod persistence;
pub mod registry;
pub mod storage;

pub use commands::{Command, CommandRequest, CommandRouter};
pub use error::{CommandError, EngineError, EngineResult};
pub use guardian::{Guardian, GuardianHandle, GuardianOptions};
