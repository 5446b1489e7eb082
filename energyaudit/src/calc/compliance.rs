//! PEC compliance checks for Schedule of Loads records.

use serde::{Deserialize, Serialize};

use super::voltage_drop::{lookup_conductor, PecCalculator};
use super::ComplianceChecker;
use crate::circuit::schema::{line_current, LoadItem, LoadSchedule, PhaseConfiguration};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub is_compliant: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl PecCalculator {
    fn check_item(&self, item: &LoadItem, voltage: f64, power_factor: f64, phase: PhaseConfiguration) -> ComplianceReport {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if item.circuit_breaker.as_deref().map_or(true, |b| b.trim().is_empty()) {
            issues.push(format!("{}: no circuit breaker specified", item.description));
            recommendations.push("Specify an overcurrent protection device for the circuit".to_string());
        }

        let current = if item.current > 0.0 {
            item.current
        } else {
            line_current(item.effective_demand_load(), voltage, power_factor, phase)
        };

        match item.conductor_size.as_deref().map(lookup_conductor) {
            None => {
                issues.push(format!("{}: no conductor size specified", item.description));
                recommendations.push("Size the branch conductor for the load current".to_string());
            }
            Some(None) => {
                issues.push(format!("{}: unrecognized conductor size", item.description));
            }
            Some(Some((spec, _))) => {
                let required = current * self.continuous_load_factor;
                if spec.ampacity(item.conductor_material) < required {
                    issues.push(format!(
                        "{}: conductor ampacity {:.0} A below required {:.1} A",
                        item.description,
                        spec.ampacity(item.conductor_material),
                        required
                    ));
                    recommendations.push("Increase the conductor size".to_string());
                }
            }
        }

        if let Some(results) = &item.voltage_drop_results {
            if results.voltage_drop_percent > self.max_voltage_drop_percent {
                issues.push(format!(
                    "{}: voltage drop {:.2}% exceeds {:.1}%",
                    item.description, results.voltage_drop_percent, self.max_voltage_drop_percent
                ));
                if let Some(size) = &item.optimal_conductor_size {
                    recommendations.push(format!("Use {} conductors to bring the drop within limits", size));
                } else {
                    recommendations.push("Shorten the run or increase the conductor size".to_string());
                }
            }
        }

        ComplianceReport {
            is_compliant: issues.is_empty(),
            issues,
            recommendations,
        }
    }
}

impl ComplianceChecker for PecCalculator {
    fn check_load_item(&self, item: &LoadItem, voltage: f64) -> ComplianceReport {
        self.check_item(item, voltage, 1.0, PhaseConfiguration::SinglePhase)
    }

    fn update_load_schedule_compliance(&self, schedule: &LoadSchedule) -> LoadSchedule {
        let loads_ok = schedule.loads.iter().all(|item| {
            self.check_item(item, schedule.voltage, schedule.power_factor, schedule.phase_configuration)
                .is_compliant
        });
        let feeder_ok = schedule
            .voltage_drop_percent
            .map_or(true, |pct| pct <= self.max_voltage_drop_percent);

        let mut updated = schedule.clone();
        updated.is_pec_compliant = Some(loads_ok && feeder_ok);
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::schema::VoltageDropResult;

    #[test]
    fn test_compliant_item() {
        let calc = PecCalculator::new();
        let item = LoadItem::new("L1", "Lighting", 10, 100.0)
            .with_conductor("12 AWG", 20.0)
            .with_breaker("20AT");
        let report = calc.check_load_item(&item, 230.0);
        assert!(report.is_compliant, "{:?}", report.issues);
    }

    #[test]
    fn test_missing_breaker_and_excess_drop() {
        let calc = PecCalculator::new();
        let mut item = LoadItem::new("L1", "Lighting", 10, 100.0).with_conductor("12 AWG", 20.0);
        item.voltage_drop_results = Some(VoltageDropResult {
            voltage_drop_percent: 4.2,
            voltage_drop: 9.66,
            receiving_end_voltage: 220.34,
            is_compliant: false,
            max_allowed_drop_percent: 3.0,
        });
        let report = calc.check_load_item(&item, 230.0);
        assert!(!report.is_compliant);
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.recommendations.len(), 2);
    }

    #[test]
    fn test_schedule_compliance_is_pure() {
        let calc = PecCalculator::new();
        let schedule = LoadSchedule::new("P-1", "Panel 1", 230.0, 0.9)
            .with_load(LoadItem::new("L1", "Lighting", 10, 100.0).with_conductor("12 AWG", 20.0));
        let updated = calc.update_load_schedule_compliance(&schedule);
        assert_eq!(updated.is_pec_compliant, Some(false));
        assert!(schedule.is_pec_compliant.is_none());
    }
}
