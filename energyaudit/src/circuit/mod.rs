//! Unified Circuit Model
//!
//! A calculator-agnostic representation of electrical circuits. Schedule of
//! Loads panels/loads and Voltage Drop calculator circuits are converted into
//! `UnifiedCircuitData` so both calculators can be compared and kept in sync.

pub mod convert;
pub mod schema;
pub mod topology;

pub use convert::*;
pub use schema::*;
pub use topology::{CircuitTopology, TopologyEdge, TopologyStats};
