//! Last Seen Guardian event bus and logbook rendering.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, carrying inbound state changes and the
//!   guardian's own events.
//! - [`GuardianEvent`]: health transitions, learning milestones and
//!   removed entities.
//! - [`logbook`]: human-readable descriptions of guardian events.

pub mod bus;
pub mod logbook;

pub use bus::{BusEvent, EventBus, GuardianEvent, RemovalReason, StateChangedEvent};
pub use logbook::{describe, LogbookEntry};
