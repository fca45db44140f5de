//! Domain logic for the Last Seen Guardian health engine.
//!
//! Everything in this crate is synchronous and free of I/O: callers pass in
//! timestamps, limits and the active mode. The async runtime, persistence
//! and command surface live in `lastseen-engine`.

pub mod config;
pub mod data_validator;
pub mod error;
pub mod health;
pub mod health_cache;
pub mod learning;
pub mod modes;
pub mod notification;
pub mod rate_limit;
pub mod technical;
pub mod types;

