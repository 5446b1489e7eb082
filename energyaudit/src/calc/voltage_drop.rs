//! PEC Voltage Drop Calculator
//!
//! Reference implementation of the voltage drop collaborator:
//! - VD = k × I × R × L / 1000, k = 2 (single phase) or √3 (three phase)
//! - R from the conductor table in Ω/km at 75 °C, corrected for ambient
//!   temperature when one is given
//! - compliance against the PEC 3 % branch/feeder limit
//!
//! Conductor sizes are accepted in AWG/kcmil ("12 AWG", "#12", "1/0") or
//! metric ("3.5 mm²", "5.5mm2") notation.

use super::{CalculationError, VoltageDropCalculator, PEC_MAX_VOLTAGE_DROP_PERCENT};
use crate::circuit::schema::{ConductorMaterial, PhaseConfiguration, VoltageDropInputs, VoltageDropResult};

/// Aluminium resistance relative to copper of the same size
const ALUMINUM_RESISTANCE_FACTOR: f64 = 1.64;
/// Aluminium ampacity relative to copper of the same size
const ALUMINUM_AMPACITY_FACTOR: f64 = 0.78;
const COPPER_TEMP_COEFFICIENT: f64 = 0.00393;
const ALUMINUM_TEMP_COEFFICIENT: f64 = 0.00403;
/// Temperature the tabulated resistances are given at (°C)
const TABLE_TEMPERATURE: f64 = 75.0;

/// One row of the conductor table
#[derive(Debug, Clone, Copy)]
pub struct ConductorSpec {
    pub awg: &'static str,
    pub metric_mm2: f64,
    /// Copper DC resistance in Ω/km at 75 °C
    pub copper_ohm_per_km: f64,
    /// Copper ampacity at 75 °C
    pub copper_ampacity: f64,
}

pub const CONDUCTOR_TABLE: &[ConductorSpec] = &[
    ConductorSpec { awg: "14", metric_mm2: 2.0, copper_ohm_per_km: 10.2, copper_ampacity: 20.0 },
    ConductorSpec { awg: "12", metric_mm2: 3.5, copper_ohm_per_km: 6.56, copper_ampacity: 25.0 },
    ConductorSpec { awg: "10", metric_mm2: 5.5, copper_ohm_per_km: 3.94, copper_ampacity: 35.0 },
    ConductorSpec { awg: "8", metric_mm2: 8.0, copper_ohm_per_km: 2.56, copper_ampacity: 50.0 },
    ConductorSpec { awg: "6", metric_mm2: 14.0, copper_ohm_per_km: 1.61, copper_ampacity: 65.0 },
    ConductorSpec { awg: "4", metric_mm2: 22.0, copper_ohm_per_km: 1.02, copper_ampacity: 85.0 },
    ConductorSpec { awg: "2", metric_mm2: 30.0, copper_ohm_per_km: 0.623, copper_ampacity: 115.0 },
    ConductorSpec { awg: "1/0", metric_mm2: 50.0, copper_ohm_per_km: 0.394, copper_ampacity: 150.0 },
    ConductorSpec { awg: "2/0", metric_mm2: 60.0, copper_ohm_per_km: 0.328, copper_ampacity: 175.0 },
    ConductorSpec { awg: "3/0", metric_mm2: 80.0, copper_ohm_per_km: 0.253, copper_ampacity: 200.0 },
    ConductorSpec { awg: "4/0", metric_mm2: 100.0, copper_ohm_per_km: 0.203, copper_ampacity: 230.0 },
    ConductorSpec { awg: "250", metric_mm2: 125.0, copper_ohm_per_km: 0.171, copper_ampacity: 255.0 },
    ConductorSpec { awg: "350", metric_mm2: 175.0, copper_ohm_per_km: 0.122, copper_ampacity: 310.0 },
    ConductorSpec { awg: "500", metric_mm2: 250.0, copper_ohm_per_km: 0.0869, copper_ampacity: 380.0 },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeNotation {
    Awg,
    Metric,
}

impl ConductorSpec {
    pub fn resistance_ohm_per_km(&self, material: ConductorMaterial, temperature: Option<f64>) -> f64 {
        let (base, alpha) = match material {
            ConductorMaterial::Copper => (self.copper_ohm_per_km, COPPER_TEMP_COEFFICIENT),
            ConductorMaterial::Aluminum => (
                self.copper_ohm_per_km * ALUMINUM_RESISTANCE_FACTOR,
                ALUMINUM_TEMP_COEFFICIENT,
            ),
        };
        match temperature {
            Some(t) => base * (1.0 + alpha * (t - TABLE_TEMPERATURE)),
            None => base,
        }
    }

    pub fn ampacity(&self, material: ConductorMaterial) -> f64 {
        match material {
            ConductorMaterial::Copper => self.copper_ampacity,
            ConductorMaterial::Aluminum => self.copper_ampacity * ALUMINUM_AMPACITY_FACTOR,
        }
    }

    pub fn display(&self, notation: SizeNotation) -> String {
        match notation {
            SizeNotation::Awg if self.awg.len() == 3 && !self.awg.contains('/') => {
                format!("{} kcmil", self.awg)
            }
            SizeNotation::Awg => format!("{} AWG", self.awg),
            SizeNotation::Metric => format!("{} mm²", self.metric_mm2),
        }
    }
}

/// Look up a conductor size string in the table
pub fn lookup_conductor(size: &str) -> Option<(&'static ConductorSpec, SizeNotation)> {
    let norm = size.trim().to_uppercase().replace([' ', '#'], "");

    let by_awg = |name: &str| CONDUCTOR_TABLE.iter().find(|c| c.awg == name);
    let by_metric = |name: &str| {
        name.parse::<f64>()
            .ok()
            .and_then(|mm2| CONDUCTOR_TABLE.iter().find(|c| (c.metric_mm2 - mm2).abs() < 1e-6))
    };

    if let Some(name) = norm.strip_suffix("AWG").or_else(|| norm.strip_suffix("KCMIL")) {
        return by_awg(name).map(|c| (c, SizeNotation::Awg));
    }
    for suffix in ["MM²", "MM2", "SQMM"] {
        if let Some(name) = norm.strip_suffix(suffix) {
            return by_metric(name).map(|c| (c, SizeNotation::Metric));
        }
    }
    by_awg(&norm)
        .map(|c| (c, SizeNotation::Awg))
        .or_else(|| by_metric(&norm).map(|c| (c, SizeNotation::Metric)))
}

/// Calculator for voltage drop per the Philippine Electrical Code
#[derive(Debug, Clone)]
pub struct PecCalculator {
    /// Maximum allowed drop for a branch or feeder, in percent
    pub max_voltage_drop_percent: f64,
    /// Continuous-load sizing factor applied to current when picking conductors
    pub continuous_load_factor: f64,
}

impl Default for PecCalculator {
    fn default() -> Self {
        Self {
            max_voltage_drop_percent: PEC_MAX_VOLTAGE_DROP_PERCENT,
            continuous_load_factor: 1.25,
        }
    }
}

impl PecCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_volts(spec: &ConductorSpec, inputs: &VoltageDropInputs) -> f64 {
        let k = match inputs.phase_configuration {
            PhaseConfiguration::SinglePhase => 2.0,
            PhaseConfiguration::ThreePhase => 3f64.sqrt(),
        };
        let r = spec.resistance_ohm_per_km(inputs.conductor_material, inputs.temperature);
        k * inputs.current * r * inputs.conductor_length / 1000.0
    }

    fn validate(inputs: &VoltageDropInputs) -> Result<(), CalculationError> {
        for (name, value) in [
            ("system voltage", inputs.system_voltage),
            ("current", inputs.current),
            ("conductor length", inputs.conductor_length),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(CalculationError::InvalidInput(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

impl VoltageDropCalculator for PecCalculator {
    fn calculate(&self, inputs: &VoltageDropInputs) -> Result<VoltageDropResult, CalculationError> {
        Self::validate(inputs)?;
        let (spec, _) = lookup_conductor(&inputs.conductor_size)
            .ok_or_else(|| CalculationError::UnknownConductor(inputs.conductor_size.clone()))?;

        let voltage_drop = Self::drop_volts(spec, inputs);
        let voltage_drop_percent = voltage_drop / inputs.system_voltage * 100.0;

        Ok(VoltageDropResult {
            voltage_drop_percent,
            voltage_drop,
            receiving_end_voltage: inputs.system_voltage - voltage_drop,
            is_compliant: voltage_drop_percent <= self.max_voltage_drop_percent,
            max_allowed_drop_percent: self.max_voltage_drop_percent,
        })
    }

    fn find_optimal_conductor_size(&self, inputs: &VoltageDropInputs) -> Option<String> {
        if Self::validate(inputs).is_err() {
            return None;
        }
        let notation = lookup_conductor(&inputs.conductor_size)
            .map(|(_, n)| n)
            .unwrap_or(SizeNotation::Awg);
        let design_current = inputs.current * self.continuous_load_factor;

        CONDUCTOR_TABLE
            .iter()
            .find(|spec| {
                let percent = Self::drop_volts(spec, inputs) / inputs.system_voltage * 100.0;
                spec.ampacity(inputs.conductor_material) >= design_current
                    && percent <= self.max_voltage_drop_percent
            })
            .map(|spec| spec.display(notation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::schema::CircuitType;

    fn inputs(size: &str, length: f64, current: f64) -> VoltageDropInputs {
        VoltageDropInputs {
            system_voltage: 230.0,
            current,
            conductor_length: length,
            conductor_size: size.to_string(),
            conductor_material: ConductorMaterial::Copper,
            conduit_material: None,
            phase_configuration: PhaseConfiguration::SinglePhase,
            power_factor: 0.9,
            temperature: None,
            circuit_type: CircuitType::Branch,
        }
    }

    #[test]
    fn test_lookup_notations() {
        assert_eq!(lookup_conductor("12 AWG").unwrap().0.awg, "12");
        assert_eq!(lookup_conductor("#12").unwrap().0.awg, "12");
        assert_eq!(lookup_conductor("1/0").unwrap().0.awg, "1/0");
        assert_eq!(lookup_conductor("3.5 mm²").unwrap().0.awg, "12");
        assert_eq!(lookup_conductor("5.5mm2").unwrap().1, SizeNotation::Metric);
        assert!(lookup_conductor("99 AWG").is_none());
    }

    #[test]
    fn test_single_phase_drop() {
        let calc = PecCalculator::new();
        let result = calc.calculate(&inputs("12 AWG", 20.0, 10.0)).unwrap();

        let expected = 2.0 * 10.0 * 6.56 * 20.0 / 1000.0;
        assert!((result.voltage_drop - expected).abs() < 1e-9);
        assert!((result.receiving_end_voltage - (230.0 - expected)).abs() < 1e-9);
        assert!(result.is_compliant);
    }

    #[test]
    fn test_long_run_not_compliant() {
        let calc = PecCalculator::new();
        let result = calc.calculate(&inputs("14 AWG", 100.0, 15.0)).unwrap();
        assert!(result.voltage_drop_percent > 3.0);
        assert!(!result.is_compliant);
    }

    #[test]
    fn test_invalid_inputs() {
        let calc = PecCalculator::new();
        assert!(matches!(
            calc.calculate(&inputs("12 AWG", 0.0, 10.0)),
            Err(CalculationError::InvalidInput(_))
        ));
        assert!(matches!(
            calc.calculate(&inputs("banana", 10.0, 10.0)),
            Err(CalculationError::UnknownConductor(_))
        ));
    }

    #[test]
    fn test_optimal_size_grows_with_length() {
        let calc = PecCalculator::new();
        let short = calc.find_optimal_conductor_size(&inputs("14 AWG", 10.0, 15.0)).unwrap();
        let long = calc.find_optimal_conductor_size(&inputs("14 AWG", 120.0, 15.0)).unwrap();
        assert_eq!(short, "14 AWG");
        assert_ne!(long, "14 AWG");

        let metric = calc.find_optimal_conductor_size(&inputs("2.0 mm²", 10.0, 15.0)).unwrap();
        assert_eq!(metric, "2 mm²");
    }
}
