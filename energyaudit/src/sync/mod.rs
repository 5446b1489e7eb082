//! Synchronization Engine
//!
//! Owns the canonical circuit map, the native record snapshots it was
//! derived from, the conflict list and the event log for one audit session.

pub mod engine;
mod state;
pub mod status;

pub use engine::{SyncEngine, SyncFailure};
pub use state::ChangeSet;
pub use status::{CircuitChange, SyncOutcome, SyncStats, SyncStatus, UpsertOutcome};
