//! EnergyAudit - circuit synchronization for energy audit calculators
//!
//! This library keeps the Schedule of Loads calculator and the Voltage Drop
//! calculator consistent. Both calculators' records are converted into a
//! canonical circuit model, disagreements between them are detected and
//! resolved, and edits trigger debounced recalculation.
//!
//! # Quick Start
//!
//! ```no_run
//! use energyaudit::{AuditSession, LoadItem, LoadSchedule, MemoryStore, SyncConfig};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let session = AuditSession::new(SyncConfig::default(), Arc::new(MemoryStore::new()));
//! let panel = LoadSchedule::new("P-1", "Panel 1", 230.0, 0.9)
//!     .with_load(LoadItem::new("L1", "Lighting", 10, 100.0).with_conductor("12 AWG", 20.0));
//! session.engine().update_load_schedule(panel).await.unwrap();
//!
//! let report = session.sync(true).await;
//! for conflict in report.unresolved() {
//!     println!("{}: {} ({})", conflict.circuit_id, conflict.conflict_type, conflict.severity);
//! }
//! # }
//! ```
//!
//! # Features
//!
//! - **Canonical circuits**: panels, loads and voltage drop runs in one model
//! - **Conflict detection**: voltage drop and conductor length mismatches
//! - **Resolution**: either side, a manual value, or newest-wins merge
//! - **Event log**: filterable, bounded history of every sync operation
//! - **Recalculation**: debounced, batched, PEC 3 % voltage drop limit

pub mod calc;
pub mod circuit;
pub mod conflict;
pub mod core;
pub mod events;
pub mod recalc;
pub mod store;
pub mod sync;

// Re-export main types
pub use crate::core::{import_calculations, AuditSession, EnergyAuditError, SyncConfig, SyncReport};
pub use calc::{CalculationError, ComplianceChecker, PecCalculator, VoltageDropCalculator};
pub use circuit::{
    CircuitSource, ConversionError, LoadItem, LoadSchedule, UnifiedCircuitData, VoltageDropInputs,
    VoltageDropRecord, VoltageDropResult,
};
pub use conflict::{
    BatchResolution, Conflict, ConflictResolutionError, ConflictSeverity, ConflictThresholds, ConflictType,
    ResolutionStrategy,
};
pub use events::{EventFilter, EventPage, EventSource, SyncEvent, SyncEventKind, SyncEventType};
pub use recalc::{RecalcPhase, RecalculationEvent, RecalculationScheduler};
pub use store::{CalculationKind, CalculationStore, MemoryStore, SqliteStore};
pub use sync::{SyncEngine, SyncOutcome, SyncStats, SyncStatus, UpsertOutcome};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        AuditSession, Conflict, ConflictSeverity, EnergyAuditError, LoadItem, LoadSchedule, ResolutionStrategy,
        SyncConfig, SyncEngine, VoltageDropRecord,
    };
}
