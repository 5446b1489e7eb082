//! Recalculation Scheduler
//!
//! Debounces circuit edits and recalculates the affected circuits in
//! batches, reporting progress to registered listeners.

pub mod scheduler;
pub mod timer;

use async_trait::async_trait;
use thiserror::Error;

use crate::calc::CalculationError;
use crate::circuit::ConversionError;

pub use scheduler::{RecalcPhase, RecalculationEvent, RecalculationListener, RecalculationScheduler, Subscription};
pub use timer::DebounceTimer;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecalculationError {
    #[error("Unknown circuit: {0}")]
    UnknownCircuit(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("Calculation failed: {0}")]
    Calculation(#[from] CalculationError),
}

/// Anything that can recalculate a circuit by canonical id
#[async_trait]
pub trait CircuitRecalculator: Send + Sync {
    async fn recalculate(&self, circuit_id: &str) -> Result<(), RecalculationError>;
}
