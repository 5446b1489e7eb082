//! Sync Event Log
//!
//! Every engine operation leaves a typed record here: sync passes, circuit
//! upserts and deletions, conflict detection and resolution. The log is
//! bounded by a `RetentionPolicy` and queried with an `EventFilter`.

pub mod log;
pub mod types;

pub use log::{EventFilter, EventPage, RetentionPolicy, SyncEventLog, MAX_RETENTION_DAYS};
pub use types::{EventSource, SyncCompletion, SyncEvent, SyncEventKind, SyncEventType, UpdateReason};
