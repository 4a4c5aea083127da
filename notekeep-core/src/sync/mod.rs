//! Synchronization and conflict resolution.
//!
//! [`SyncEngine`] decides, per note, which of the local and remote copies is
//! authoritative. The append-only heuristic and the merge live in
//! [`divergence`] as plain functions so they stay testable in isolation.

pub mod divergence;
mod engine;

pub use divergence::{classify, merge_contents, Divergence};
pub use engine::{
    EngineConfig, SaveError, SyncContext, SyncEngine, SyncStatus, DEFAULT_PUSH_FAILURE_CEILING,
    DEFAULT_REMOTE_TIMEOUT,
};
