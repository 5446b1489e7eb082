//! Circuit Data Types
//!
//! This module defines the records exchanged between the two calculators and
//! the canonical circuit the synchronization engine keeps for each of them:
//! - `LoadItem` / `LoadSchedule`: native Schedule of Loads records
//! - `VoltageDropRecord`: native Voltage Drop calculator circuit
//! - `UnifiedCircuitData`: the canonical, calculator-agnostic circuit
//!
//! All records serialize in camelCase so saved calculations written by the
//! web calculators deserialize directly.

use serde::{Deserialize, Serialize};

/// Calculator that authored a canonical circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitSource {
    VoltageDrop,
    ScheduleOfLoads,
}

impl CircuitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitSource::VoltageDrop => "voltage-drop",
            CircuitSource::ScheduleOfLoads => "schedule-of-loads",
        }
    }
}

impl std::fmt::Display for CircuitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a circuit is a branch load or a panel feeder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CircuitType {
    #[default]
    Branch,
    Feeder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseConfiguration {
    #[default]
    SinglePhase,
    ThreePhase,
}

impl PhaseConfiguration {
    /// Multiplier applied to `V · pf` when deriving line current
    pub fn current_factor(&self) -> f64 {
        match self {
            PhaseConfiguration::SinglePhase => 1.0,
            PhaseConfiguration::ThreePhase => 3f64.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConductorMaterial {
    #[default]
    Copper,
    Aluminum,
}

/// Output of a voltage drop calculation, stored on whichever native record
/// it was computed for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoltageDropResult {
    pub voltage_drop_percent: f64,
    /// Absolute drop in volts
    pub voltage_drop: f64,
    pub receiving_end_voltage: f64,
    pub is_compliant: bool,
    pub max_allowed_drop_percent: f64,
}

/// Inputs required by the voltage drop calculator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoltageDropInputs {
    pub system_voltage: f64,
    /// Load current in amperes
    pub current: f64,
    /// One-way conductor length in meters
    pub conductor_length: f64,
    pub conductor_size: String,
    #[serde(default)]
    pub conductor_material: ConductorMaterial,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conduit_material: Option<String>,
    #[serde(default)]
    pub phase_configuration: PhaseConfiguration,
    #[serde(default = "default_power_factor")]
    pub power_factor: f64,
    /// Ambient temperature in °C
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub circuit_type: CircuitType,
}

fn default_power_factor() -> f64 {
    0.8
}

fn default_demand_factor() -> f64 {
    1.0
}

/// A single branch load on a Schedule of Loads panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadItem {
    pub id: String,
    pub description: String,
    pub quantity: u32,
    /// Unit rating in watts
    pub rating: f64,
    #[serde(default = "default_demand_factor")]
    pub demand_factor: f64,
    #[serde(default)]
    pub connected_load: f64,
    #[serde(default)]
    pub demand_load: f64,
    #[serde(default)]
    pub current: f64,
    #[serde(default)]
    pub volt_ampere: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conductor_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conductor_length: Option<f64>,
    #[serde(default)]
    pub conductor_material: ConductorMaterial,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conduit_material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_drop_results: Option<VoltageDropResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimal_conductor_size: Option<String>,
    /// Epoch milliseconds of the last edit
    #[serde(default)]
    pub updated_at: i64,
}

impl LoadItem {
    pub fn new(id: impl Into<String>, description: impl Into<String>, quantity: u32, rating: f64) -> Self {
        let connected_load = f64::from(quantity) * rating;
        Self {
            id: id.into(),
            description: description.into(),
            quantity,
            rating,
            demand_factor: 1.0,
            connected_load,
            demand_load: connected_load,
            current: 0.0,
            volt_ampere: 0.0,
            circuit_breaker: None,
            conductor_size: None,
            conductor_length: None,
            conductor_material: ConductorMaterial::Copper,
            conduit_material: None,
            temperature: None,
            voltage_drop_results: None,
            optimal_conductor_size: None,
            updated_at: 0,
        }
    }

    pub fn with_demand_factor(mut self, demand_factor: f64) -> Self {
        self.demand_factor = demand_factor;
        self.demand_load = self.connected_load * demand_factor;
        self
    }

    pub fn with_conductor(mut self, size: impl Into<String>, length_m: f64) -> Self {
        self.conductor_size = Some(size.into());
        self.conductor_length = Some(length_m);
        self
    }

    pub fn with_breaker(mut self, breaker: impl Into<String>) -> Self {
        self.circuit_breaker = Some(breaker.into());
        self
    }

    pub fn with_updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Connected load, falling back to `quantity × rating` when unset
    pub fn effective_connected_load(&self) -> f64 {
        if self.connected_load > 0.0 {
            self.connected_load
        } else {
            f64::from(self.quantity) * self.rating
        }
    }

    /// Demand load, falling back to `connected × demand factor` when unset
    pub fn effective_demand_load(&self) -> f64 {
        if self.demand_load > 0.0 {
            self.demand_load
        } else {
            self.effective_connected_load() * self.demand_factor
        }
    }
}

/// A Schedule of Loads panel with its branch loads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSchedule {
    pub id: String,
    pub panel_name: String,
    pub voltage: f64,
    #[serde(default = "default_power_factor")]
    pub power_factor: f64,
    #[serde(default)]
    pub phase_configuration: PhaseConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_breaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conductor_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conductor_length: Option<f64>,
    #[serde(default)]
    pub conductor_material: ConductorMaterial,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conduit_material: Option<String>,
    #[serde(default)]
    pub loads: Vec<LoadItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_drop_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_drop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_end_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_pec_compliant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimal_conductor_size: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}

impl LoadSchedule {
    pub fn new(id: impl Into<String>, panel_name: impl Into<String>, voltage: f64, power_factor: f64) -> Self {
        Self {
            id: id.into(),
            panel_name: panel_name.into(),
            voltage,
            power_factor,
            phase_configuration: PhaseConfiguration::SinglePhase,
            main_breaker: None,
            conductor_size: None,
            conductor_length: None,
            conductor_material: ConductorMaterial::Copper,
            conduit_material: None,
            loads: Vec::new(),
            voltage_drop_percent: None,
            voltage_drop: None,
            receiving_end_voltage: None,
            is_pec_compliant: None,
            optimal_conductor_size: None,
            updated_at: 0,
        }
    }

    pub fn with_load(mut self, load: LoadItem) -> Self {
        self.loads.push(load);
        self
    }

    pub fn with_feeder(mut self, size: impl Into<String>, length_m: f64) -> Self {
        self.conductor_size = Some(size.into());
        self.conductor_length = Some(length_m);
        self
    }

    pub fn with_updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn load(&self, load_id: &str) -> Option<&LoadItem> {
        self.loads.iter().find(|l| l.id == load_id)
    }

    pub fn load_mut(&mut self, load_id: &str) -> Option<&mut LoadItem> {
        self.loads.iter_mut().find(|l| l.id == load_id)
    }

    pub fn total_connected_load(&self) -> f64 {
        self.loads.iter().map(LoadItem::effective_connected_load).sum()
    }

    pub fn total_demand_load(&self) -> f64 {
        self.loads.iter().map(LoadItem::effective_demand_load).sum()
    }

    /// Feeder current drawn by the whole panel
    pub fn total_current(&self) -> f64 {
        line_current(
            self.total_demand_load(),
            self.voltage,
            self.power_factor,
            self.phase_configuration,
        )
    }

    /// Most recent edit across the panel and its loads
    pub fn latest_update(&self) -> i64 {
        self.loads
            .iter()
            .map(|l| l.updated_at)
            .chain(std::iter::once(self.updated_at))
            .max()
            .unwrap_or(self.updated_at)
    }
}

/// A circuit as saved by the Voltage Drop calculator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoltageDropRecord {
    pub id: String,
    pub name: String,
    pub inputs: VoltageDropInputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<VoltageDropResult>,
    /// Canonical id of the Schedule of Loads circuit this record analyses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_circuit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimal_conductor_size: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}

impl VoltageDropRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, inputs: VoltageDropInputs) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            inputs,
            results: None,
            linked_circuit_id: None,
            optimal_conductor_size: None,
            updated_at: 0,
        }
    }

    pub fn linked_to(mut self, circuit_id: impl Into<String>) -> Self {
        self.linked_circuit_id = Some(circuit_id.into());
        self
    }

    pub fn with_results(mut self, results: VoltageDropResult) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = updated_at;
        self
    }
}

/// The canonical circuit record shared by both calculators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedCircuitData {
    pub id: String,
    pub source: CircuitSource,
    /// Native id of the originating record, or the linked Schedule of Loads
    /// circuit for voltage drop records
    pub source_id: String,

    pub description: String,
    pub quantity: u32,
    pub rating: f64,
    pub demand_factor: f64,
    pub connected_load: f64,
    pub demand_load: f64,
    pub current: f64,
    pub volt_ampere: f64,
    pub circuit_breaker: Option<String>,
    pub conductor_size: Option<String>,
    pub conductor_length: Option<f64>,
    pub conductor_material: ConductorMaterial,
    pub conduit_material: Option<String>,
    pub circuit_type: CircuitType,
    pub phase_configuration: PhaseConfiguration,
    pub temperature: Option<f64>,
    pub voltage: f64,
    pub power_factor: f64,

    pub voltage_drop_percent: Option<f64>,
    pub voltage_drop: Option<f64>,
    pub receiving_end_voltage: Option<f64>,
    #[serde(rename = "isPECCompliant")]
    pub is_pec_compliant: Option<bool>,
    pub optimal_conductor_size: Option<String>,

    pub last_updated: i64,
}

impl UnifiedCircuitData {
    pub fn is_feeder(&self) -> bool {
        self.circuit_type == CircuitType::Feeder
    }

    /// True when the two records differ in anything but `last_updated`.
    pub fn differs_from(&self, other: &UnifiedCircuitData) -> bool {
        let mut a = self.clone();
        a.last_updated = other.last_updated;
        a != *other
    }
}

/// Line current for a demand load; zero when voltage or power factor is unset
pub fn line_current(demand_load: f64, voltage: f64, power_factor: f64, phase: PhaseConfiguration) -> f64 {
    let denom = voltage * power_factor * phase.current_factor();
    if denom > 0.0 {
        demand_load / denom
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_item_connected_load() {
        let item = LoadItem::new("L1", "Lighting", 10, 100.0);
        assert_eq!(item.connected_load, 1000.0);
        assert_eq!(item.effective_demand_load(), 1000.0);

        let item = item.with_demand_factor(0.5);
        assert_eq!(item.demand_load, 500.0);
    }

    #[test]
    fn test_schedule_totals() {
        let schedule = LoadSchedule::new("P-1", "Panel 1", 230.0, 0.9)
            .with_load(LoadItem::new("L1", "Lighting", 10, 100.0))
            .with_load(LoadItem::new("L2", "Receptacles", 4, 180.0));

        assert_eq!(schedule.total_connected_load(), 1720.0);
        let expected = 1720.0 / (230.0 * 0.9);
        assert!((schedule.total_current() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_three_phase_current() {
        let i = line_current(10_000.0, 400.0, 1.0, PhaseConfiguration::ThreePhase);
        assert!((i - 10_000.0 / (400.0 * 3f64.sqrt())).abs() < 1e-9);
        assert_eq!(line_current(100.0, 0.0, 0.9, PhaseConfiguration::SinglePhase), 0.0);
    }

    #[test]
    fn test_source_serialization() {
        let json = serde_json::to_string(&CircuitSource::ScheduleOfLoads).unwrap();
        assert_eq!(json, "\"schedule-of-loads\"");
        let parsed: CircuitSource = serde_json::from_str("\"voltage-drop\"").unwrap();
        assert_eq!(parsed, CircuitSource::VoltageDrop);
    }

    #[test]
    fn test_load_item_defaults_from_json() {
        let item: LoadItem = serde_json::from_str(
            r#"{"id":"L1","description":"Lighting","quantity":10,"rating":100}"#,
        )
        .unwrap();
        assert_eq!(item.demand_factor, 1.0);
        assert_eq!(item.effective_connected_load(), 1000.0);
        assert!(item.conductor_length.is_none());
    }
}
