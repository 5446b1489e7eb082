//! Pairwise conflict detection between Voltage Drop circuits and their
//! Schedule of Loads counterparts.

use serde::{Deserialize, Serialize};

use super::types::{ConflictSeverity, ConflictType, SourceValue};

/// Detection thresholds. Severity ordering is fixed; only the cut-offs move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictThresholds {
    /// Minimum voltage drop difference (percentage points) that counts as a conflict
    pub voltage_drop_percent: f64,
    pub high_voltage_drop_percent: f64,
    /// Difference above which a non-compliant pair is critical
    pub critical_voltage_drop_percent: f64,
    /// Minimum conductor length difference in meters
    pub conductor_length_m: f64,
    pub medium_conductor_length_m: f64,
    pub high_conductor_length_m: f64,
}

impl Default for ConflictThresholds {
    fn default() -> Self {
        Self {
            voltage_drop_percent: 0.5,
            high_voltage_drop_percent: 1.0,
            critical_voltage_drop_percent: 2.0,
            conductor_length_m: 1.0,
            medium_conductor_length_m: 5.0,
            high_conductor_length_m: 10.0,
        }
    }
}

impl ConflictThresholds {
    /// Severity of a voltage drop disagreement, or `None` within tolerance
    pub fn voltage_drop_severity(
        &self,
        delta: f64,
        voltage_drop_compliant: Option<bool>,
        schedule_of_loads_compliant: Option<bool>,
    ) -> Option<ConflictSeverity> {
        let delta = delta.abs();
        if !(delta > self.voltage_drop_percent) {
            return None;
        }
        let non_compliant =
            voltage_drop_compliant == Some(false) || schedule_of_loads_compliant == Some(false);
        if non_compliant && delta > self.critical_voltage_drop_percent {
            Some(ConflictSeverity::Critical)
        } else if delta > self.high_voltage_drop_percent {
            Some(ConflictSeverity::High)
        } else {
            Some(ConflictSeverity::Medium)
        }
    }

    /// Severity of a conductor length disagreement, or `None` within tolerance
    pub fn conductor_length_severity(&self, delta: f64) -> Option<ConflictSeverity> {
        let delta = delta.abs();
        if !(delta > self.conductor_length_m) {
            None
        } else if delta > self.high_conductor_length_m {
            Some(ConflictSeverity::High)
        } else if delta > self.medium_conductor_length_m {
            Some(ConflictSeverity::Medium)
        } else {
            Some(ConflictSeverity::Low)
        }
    }
}

/// Values one calculator holds for a circuit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideSnapshot {
    pub voltage_drop_percent: Option<f64>,
    pub conductor_length: Option<f64>,
    pub is_compliant: Option<bool>,
    pub timestamp: i64,
}

/// A Voltage Drop circuit paired with the Schedule of Loads circuit it analyses
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitComparison {
    pub circuit_id: String,
    pub counterpart_id: String,
    pub name: String,
    pub voltage_drop: SideSnapshot,
    pub schedule_of_loads: SideSnapshot,
}

/// A disagreement found in one comparison
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictFinding {
    pub circuit_id: String,
    pub counterpart_id: String,
    pub name: String,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub voltage_drop_source: SourceValue,
    pub schedule_of_loads_source: SourceValue,
    pub voltage_drop_compliant: Option<bool>,
    pub schedule_of_loads_compliant: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    thresholds: ConflictThresholds,
}

impl ConflictDetector {
    pub fn new(thresholds: ConflictThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ConflictThresholds {
        &self.thresholds
    }

    pub fn detect(&self, comparisons: &[CircuitComparison]) -> Vec<ConflictFinding> {
        comparisons.iter().flat_map(|c| self.compare(c)).collect()
    }

    /// Findings for a single pair, at most one per conflict type
    pub fn compare(&self, pair: &CircuitComparison) -> Vec<ConflictFinding> {
        let vd = &pair.voltage_drop;
        let sol = &pair.schedule_of_loads;
        let mut findings = Vec::new();

        if let (Some(a), Some(b)) = (vd.voltage_drop_percent, sol.voltage_drop_percent) {
            if let Some(severity) = self
                .thresholds
                .voltage_drop_severity(a - b, vd.is_compliant, sol.is_compliant)
            {
                findings.push(self.finding(pair, ConflictType::VoltageDropMismatch, severity, a, b));
            }
        }

        if let (Some(a), Some(b)) = (vd.conductor_length, sol.conductor_length) {
            if let Some(severity) = self.thresholds.conductor_length_severity(a - b) {
                findings.push(self.finding(pair, ConflictType::ConductorLengthMismatch, severity, a, b));
            }
        }

        findings
    }

    fn finding(
        &self,
        pair: &CircuitComparison,
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        voltage_drop_value: f64,
        schedule_of_loads_value: f64,
    ) -> ConflictFinding {
        ConflictFinding {
            circuit_id: pair.circuit_id.clone(),
            counterpart_id: pair.counterpart_id.clone(),
            name: pair.name.clone(),
            conflict_type,
            severity,
            voltage_drop_source: SourceValue::new(voltage_drop_value, pair.voltage_drop.timestamp),
            schedule_of_loads_source: SourceValue::new(
                schedule_of_loads_value,
                pair.schedule_of_loads.timestamp,
            ),
            voltage_drop_compliant: pair.voltage_drop.is_compliant,
            schedule_of_loads_compliant: pair.schedule_of_loads.is_compliant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(vd_pct: f64, vd_ok: bool, sol_pct: f64, sol_ok: bool) -> CircuitComparison {
        CircuitComparison {
            circuit_id: "vd-a".to_string(),
            counterpart_id: "P-1-L1".to_string(),
            name: "Lighting".to_string(),
            voltage_drop: SideSnapshot {
                voltage_drop_percent: Some(vd_pct),
                conductor_length: Some(20.0),
                is_compliant: Some(vd_ok),
                timestamp: 100,
            },
            schedule_of_loads: SideSnapshot {
                voltage_drop_percent: Some(sol_pct),
                conductor_length: Some(20.0),
                is_compliant: Some(sol_ok),
                timestamp: 200,
            },
        }
    }

    #[test]
    fn test_within_tolerance() {
        let detector = ConflictDetector::default();
        assert!(detector.compare(&pair(3.2, false, 3.6, false)).is_empty());
    }

    #[test]
    fn test_high_severity() {
        let detector = ConflictDetector::default();
        let findings = detector.compare(&pair(3.2, true, 4.5, true));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].conflict_type, ConflictType::VoltageDropMismatch);
        assert_eq!(findings[0].severity, ConflictSeverity::High);
        assert_eq!(findings[0].voltage_drop_source.value, 3.2);
        assert_eq!(findings[0].schedule_of_loads_source.timestamp, 200);
    }

    #[test]
    fn test_critical_requires_non_compliance() {
        let detector = ConflictDetector::default();
        let findings = detector.compare(&pair(1.0, true, 3.5, false));
        assert_eq!(findings[0].severity, ConflictSeverity::Critical);

        let findings = detector.compare(&pair(0.5, true, 2.8, true));
        assert_eq!(findings[0].severity, ConflictSeverity::High);
    }

    #[test]
    fn test_medium_band() {
        let thresholds = ConflictThresholds::default();
        assert_eq!(
            thresholds.voltage_drop_severity(0.8, Some(false), Some(false)),
            Some(ConflictSeverity::Medium)
        );
        assert_eq!(thresholds.voltage_drop_severity(0.5, None, None), None);
    }

    #[test]
    fn test_conductor_length_bands() {
        let thresholds = ConflictThresholds::default();
        assert_eq!(thresholds.conductor_length_severity(0.9), None);
        assert_eq!(thresholds.conductor_length_severity(3.0), Some(ConflictSeverity::Low));
        assert_eq!(thresholds.conductor_length_severity(-7.0), Some(ConflictSeverity::Medium));
        assert_eq!(thresholds.conductor_length_severity(12.0), Some(ConflictSeverity::High));
    }

    #[test]
    fn test_missing_values_skip_comparison() {
        let detector = ConflictDetector::default();
        let mut p = pair(1.0, true, 4.0, true);
        p.schedule_of_loads.voltage_drop_percent = None;
        p.voltage_drop.conductor_length = Some(40.0);
        let findings = detector.compare(&p);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].conflict_type, ConflictType::ConductorLengthMismatch);
        assert_eq!(findings[0].severity, ConflictSeverity::High);
    }
}
