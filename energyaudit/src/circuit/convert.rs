//! Conversions between calculator records and the canonical circuit
//!
//! Schedule of Loads panels and loads, and Voltage Drop calculator circuits,
//! are all projected into `UnifiedCircuitData`. Projections into calculation
//! inputs are strict: a circuit without a positive conductor length or
//! current cannot be calculated and is rejected with a `ConversionError`.

use thiserror::Error;

use super::schema::*;
use crate::calc::PEC_MAX_VOLTAGE_DROP_PERCENT;

/// Errors raised when a record cannot be converted
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("Circuit {circuit_id}: missing required field {field}")]
    MissingField {
        circuit_id: String,
        field: &'static str,
    },

    #[error("Circuit {circuit_id}: {field} must be positive, got {value}")]
    NonPositive {
        circuit_id: String,
        field: &'static str,
        value: f64,
    },
}

/// Canonical id of a Schedule of Loads branch circuit
pub fn sol_circuit_id(panel_id: Option<&str>, load_id: &str) -> String {
    match panel_id {
        Some(panel) => format!("{}-{}", panel, load_id),
        None => load_id.to_string(),
    }
}

/// Canonical id of a Voltage Drop calculator circuit
pub fn vd_circuit_id(record_id: &str) -> String {
    format!("vd-{}", record_id)
}

/// Build a branch circuit from a load item.
///
/// Loads that leave aggregate fields at zero get them derived from
/// quantity, rating, demand factor and the panel's voltage/power factor.
pub fn load_item_to_unified_circuit(
    item: &LoadItem,
    panel_id: Option<&str>,
    system_voltage: f64,
    power_factor: f64,
    phase: PhaseConfiguration,
) -> UnifiedCircuitData {
    let connected_load = item.effective_connected_load();
    let demand_load = item.effective_demand_load();
    let current = if item.current > 0.0 {
        item.current
    } else {
        line_current(demand_load, system_voltage, power_factor, phase)
    };
    let volt_ampere = if item.volt_ampere > 0.0 {
        item.volt_ampere
    } else if power_factor > 0.0 {
        demand_load / power_factor
    } else {
        demand_load
    };

    let results = item.voltage_drop_results.as_ref();

    UnifiedCircuitData {
        id: sol_circuit_id(panel_id, &item.id),
        source: CircuitSource::ScheduleOfLoads,
        source_id: item.id.clone(),
        description: item.description.clone(),
        quantity: item.quantity,
        rating: item.rating,
        demand_factor: item.demand_factor,
        connected_load,
        demand_load,
        current,
        volt_ampere,
        circuit_breaker: item.circuit_breaker.clone(),
        conductor_size: item.conductor_size.clone(),
        conductor_length: item.conductor_length,
        conductor_material: item.conductor_material,
        conduit_material: item.conduit_material.clone(),
        circuit_type: CircuitType::Branch,
        phase_configuration: phase,
        temperature: item.temperature,
        voltage: system_voltage,
        power_factor,
        voltage_drop_percent: results.map(|r| r.voltage_drop_percent),
        voltage_drop: results.map(|r| r.voltage_drop),
        receiving_end_voltage: results.map(|r| r.receiving_end_voltage),
        is_pec_compliant: results.map(|r| r.is_compliant),
        optimal_conductor_size: item.optimal_conductor_size.clone(),
        last_updated: item.updated_at,
    }
}

/// Build the feeder circuit summarizing a whole panel
pub fn load_schedule_to_unified_circuit(schedule: &LoadSchedule) -> UnifiedCircuitData {
    let demand_load = schedule.total_demand_load();
    let connected_load = schedule.total_connected_load();
    let demand_factor = if connected_load > 0.0 {
        demand_load / connected_load
    } else {
        1.0
    };
    let volt_ampere = if schedule.power_factor > 0.0 {
        demand_load / schedule.power_factor
    } else {
        demand_load
    };

    UnifiedCircuitData {
        id: schedule.id.clone(),
        source: CircuitSource::ScheduleOfLoads,
        source_id: schedule.id.clone(),
        description: schedule.panel_name.clone(),
        quantity: 1,
        rating: connected_load,
        demand_factor,
        connected_load,
        demand_load,
        current: schedule.total_current(),
        volt_ampere,
        circuit_breaker: schedule.main_breaker.clone(),
        conductor_size: schedule.conductor_size.clone(),
        conductor_length: schedule.conductor_length,
        conductor_material: schedule.conductor_material,
        conduit_material: schedule.conduit_material.clone(),
        circuit_type: CircuitType::Feeder,
        phase_configuration: schedule.phase_configuration,
        temperature: None,
        voltage: schedule.voltage,
        power_factor: schedule.power_factor,
        voltage_drop_percent: schedule.voltage_drop_percent,
        voltage_drop: schedule.voltage_drop,
        receiving_end_voltage: schedule.receiving_end_voltage,
        is_pec_compliant: schedule.is_pec_compliant,
        optimal_conductor_size: schedule.optimal_conductor_size.clone(),
        last_updated: schedule.updated_at,
    }
}

/// Build the canonical circuit for a Voltage Drop calculator record.
///
/// Linked records point their `source_id` at the Schedule of Loads circuit
/// they analyse.
pub fn voltage_drop_record_to_unified_circuit(
    record: &VoltageDropRecord,
) -> Result<UnifiedCircuitData, ConversionError> {
    let id = vd_circuit_id(&record.id);
    let inputs = &record.inputs;
    if inputs.system_voltage <= 0.0 {
        return Err(ConversionError::NonPositive {
            circuit_id: id,
            field: "systemVoltage",
            value: inputs.system_voltage,
        });
    }

    let apparent = inputs.system_voltage * inputs.current * inputs.phase_configuration.current_factor();
    let demand_load = apparent * inputs.power_factor;
    let results = record.results.as_ref();

    Ok(UnifiedCircuitData {
        id,
        source: CircuitSource::VoltageDrop,
        source_id: record
            .linked_circuit_id
            .clone()
            .unwrap_or_else(|| record.id.clone()),
        description: record.name.clone(),
        quantity: 1,
        rating: demand_load,
        demand_factor: 1.0,
        connected_load: demand_load,
        demand_load,
        current: inputs.current,
        volt_ampere: apparent,
        circuit_breaker: None,
        conductor_size: Some(inputs.conductor_size.clone()),
        conductor_length: Some(inputs.conductor_length),
        conductor_material: inputs.conductor_material,
        conduit_material: inputs.conduit_material.clone(),
        circuit_type: inputs.circuit_type,
        phase_configuration: inputs.phase_configuration,
        temperature: inputs.temperature,
        voltage: inputs.system_voltage,
        power_factor: inputs.power_factor,
        voltage_drop_percent: results.map(|r| r.voltage_drop_percent),
        voltage_drop: results.map(|r| r.voltage_drop),
        receiving_end_voltage: results.map(|r| r.receiving_end_voltage),
        is_pec_compliant: results.map(|r| r.is_compliant),
        optimal_conductor_size: record.optimal_conductor_size.clone(),
        last_updated: record.updated_at,
    })
}

/// Project a canonical circuit into voltage drop calculation inputs
pub fn unified_circuit_to_voltage_drop_inputs(
    circuit: &UnifiedCircuitData,
) -> Result<VoltageDropInputs, ConversionError> {
    let conductor_length = circuit.conductor_length.ok_or_else(|| ConversionError::MissingField {
        circuit_id: circuit.id.clone(),
        field: "conductorLength",
    })?;
    require_positive(&circuit.id, "conductorLength", conductor_length)?;
    require_positive(&circuit.id, "current", circuit.current)?;
    require_positive(&circuit.id, "voltage", circuit.voltage)?;

    let conductor_size = circuit
        .conductor_size
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConversionError::MissingField {
            circuit_id: circuit.id.clone(),
            field: "conductorSize",
        })?;

    Ok(VoltageDropInputs {
        system_voltage: circuit.voltage,
        current: circuit.current,
        conductor_length,
        conductor_size,
        conductor_material: circuit.conductor_material,
        conduit_material: circuit.conduit_material.clone(),
        phase_configuration: circuit.phase_configuration,
        power_factor: circuit.power_factor,
        temperature: circuit.temperature,
        circuit_type: circuit.circuit_type,
    })
}

fn require_positive(circuit_id: &str, field: &'static str, value: f64) -> Result<(), ConversionError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConversionError::NonPositive {
            circuit_id: circuit_id.to_string(),
            field,
            value,
        })
    }
}

/// Return a copy of `item` carrying the computed voltage drop fields
pub fn update_load_item_with_voltage_drop_results(
    item: &LoadItem,
    voltage_drop_percent: f64,
    voltage_drop: f64,
    receiving_end_voltage: f64,
    is_compliant: bool,
    conductor_length: f64,
    optimal_conductor_size: Option<&str>,
) -> LoadItem {
    let mut updated = item.clone();
    updated.voltage_drop_results = Some(VoltageDropResult {
        voltage_drop_percent,
        voltage_drop,
        receiving_end_voltage,
        is_compliant,
        max_allowed_drop_percent: PEC_MAX_VOLTAGE_DROP_PERCENT,
    });
    updated.conductor_length = Some(conductor_length);
    if let Some(size) = optimal_conductor_size {
        updated.optimal_conductor_size = Some(size.to_string());
    }
    updated
}

/// Return a copy of `schedule` carrying the computed feeder voltage drop fields
pub fn update_load_schedule_with_voltage_drop_results(
    schedule: &LoadSchedule,
    voltage_drop_percent: f64,
    voltage_drop: f64,
    receiving_end_voltage: f64,
    is_compliant: bool,
    conductor_length: f64,
    optimal_conductor_size: Option<&str>,
) -> LoadSchedule {
    let mut updated = schedule.clone();
    updated.voltage_drop_percent = Some(voltage_drop_percent);
    updated.voltage_drop = Some(voltage_drop);
    updated.receiving_end_voltage = Some(receiving_end_voltage);
    updated.is_pec_compliant = Some(is_compliant);
    updated.conductor_length = Some(conductor_length);
    if let Some(size) = optimal_conductor_size {
        updated.optimal_conductor_size = Some(size.to_string());
    }
    updated
}
