//! Scribeflow Core Engine
//!
//! Client-side job-status synchronization for the Scribeflow
//! transcription service. Keeps a local view of one-or-many long-running
//! backend jobs consistent under polling, concurrent user actions and
//! partial failures: status normalization, adaptive polling, sibling
//! batch detection and aggregation, optimistic mutations with exact
//! rollback, and debounced cache invalidation.
//!
//! The UI shell consumes this crate through [`SyncEngine`] and its event
//! channel; rendering, uploads and authentication live elsewhere.

pub mod actions;
pub mod api;
pub mod batch;
pub mod engine;
pub mod events;
pub mod jobs;
pub mod poller;
pub mod settings;
pub mod store;
pub mod stuck;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

pub use engine::{EngineConfig, SyncEngine};

#[cfg(test)]
mod tests_flow;
