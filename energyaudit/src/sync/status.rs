use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::EventSource;

/// Engine-level synchronization status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_enabled: bool,
    pub auto_sync: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
}

/// Counters derived from engine state after every mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Circuits modified since the last `clear_changes`
    pub changed_circuits: usize,
    /// Circuits processed by the last successful sync pass
    pub synced_circuits: usize,
    /// Unresolved conflicts
    pub conflicts: usize,
}

/// Result of one `sync_now` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub successful: bool,
    /// True when sync was disabled and nothing ran
    pub skipped: bool,
    pub duration_ms: u64,
    pub circuits_processed: usize,
    pub conflicts_detected: usize,
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Result of a single-record upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Circuits touched by an edit, broadcast to change subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitChange {
    pub circuit_ids: Vec<String>,
    pub source: EventSource,
}
