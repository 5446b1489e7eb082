//! Calculation collaborators
//!
//! The engine treats the engineering formulas as black boxes behind two
//! traits. `PecCalculator` is the bundled implementation of both.

pub mod compliance;
pub mod voltage_drop;

use thiserror::Error;

use crate::circuit::schema::{LoadItem, LoadSchedule, VoltageDropInputs, VoltageDropResult};

pub use compliance::ComplianceReport;
pub use voltage_drop::{lookup_conductor, ConductorSpec, PecCalculator, CONDUCTOR_TABLE};

/// PEC limit for branch circuit and feeder voltage drop, in percent
pub const PEC_MAX_VOLTAGE_DROP_PERCENT: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalculationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown conductor size: {0}")]
    UnknownConductor(String),
}

/// Voltage drop calculation consumed by the engine
pub trait VoltageDropCalculator: Send + Sync {
    fn calculate(&self, inputs: &VoltageDropInputs) -> Result<VoltageDropResult, CalculationError>;

    /// Smallest conductor meeting ampacity and drop limits, if any
    fn find_optimal_conductor_size(&self, inputs: &VoltageDropInputs) -> Option<String>;
}

/// PEC compliance checks consumed by the engine
pub trait ComplianceChecker: Send + Sync {
    fn check_load_item(&self, item: &LoadItem, voltage: f64) -> ComplianceReport;

    /// Return a copy of the schedule with its compliance flag refreshed
    fn update_load_schedule_compliance(&self, schedule: &LoadSchedule) -> LoadSchedule;
}
