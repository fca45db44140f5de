//! Library half of `lastseen-daemon`: configuration, stdin ingest and the
//! logbook writer. The binary in `main.rs` wires them to the engine.

pub mod config;
pub mod ingest;
pub mod logbook;
