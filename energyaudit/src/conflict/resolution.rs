//! Choosing the value a conflict resolves to.

use serde::Serialize;

use super::types::{Conflict, ResolutionStrategy};
use super::ConflictResolutionError;

/// The side (or value) a resolution settles on
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedValue {
    VoltageDrop(f64),
    ScheduleOfLoads(f64),
    Manual(f64),
}

impl ResolvedValue {
    pub fn value(&self) -> f64 {
        match *self {
            ResolvedValue::VoltageDrop(v) | ResolvedValue::ScheduleOfLoads(v) | ResolvedValue::Manual(v) => v,
        }
    }
}

/// Pick the resolved value for `conflict`.
///
/// Merge keeps whichever side was authored last; equal timestamps go to the
/// Voltage Drop side. Manual values must be finite and non-negative.
pub fn decide(conflict: &Conflict, strategy: ResolutionStrategy) -> Result<ResolvedValue, ConflictResolutionError> {
    let vd = conflict.voltage_drop_source;
    let sol = conflict.schedule_of_loads_source;
    match strategy {
        ResolutionStrategy::VoltageDrop => Ok(ResolvedValue::VoltageDrop(vd.value)),
        ResolutionStrategy::ScheduleOfLoads => Ok(ResolvedValue::ScheduleOfLoads(sol.value)),
        ResolutionStrategy::Manual(value) => {
            if value.is_finite() && value >= 0.0 {
                Ok(ResolvedValue::Manual(value))
            } else {
                Err(ConflictResolutionError::InvalidValue(value))
            }
        }
        ResolutionStrategy::Merge => {
            if sol.timestamp > vd.timestamp {
                Ok(ResolvedValue::ScheduleOfLoads(sol.value))
            } else {
                Ok(ResolvedValue::VoltageDrop(vd.value))
            }
        }
    }
}

/// Outcome of resolving several conflicts with one strategy
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResolution {
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedResolution>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedResolution {
    pub conflict_id: String,
    pub error: String,
}

impl BatchResolution {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn record(&mut self, conflict_id: &str, result: Result<(), ConflictResolutionError>) {
        match result {
            Ok(()) => self.succeeded.push(conflict_id.to_string()),
            Err(e) => self.failed.push(FailedResolution {
                conflict_id: conflict_id.to_string(),
                error: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::types::{ConflictSeverity, ConflictType, SourceValue};
    use chrono::Utc;

    fn conflict(vd: (f64, i64), sol: (f64, i64)) -> Conflict {
        Conflict {
            id: "c1".to_string(),
            circuit_id: "vd-a".to_string(),
            counterpart_id: "P-1-L1".to_string(),
            name: "Lighting".to_string(),
            conflict_type: ConflictType::VoltageDropMismatch,
            severity: ConflictSeverity::High,
            timestamp: Utc::now(),
            resolved: false,
            voltage_drop_source: SourceValue::new(vd.0, vd.1),
            schedule_of_loads_source: SourceValue::new(sol.0, sol.1),
            voltage_drop_compliant: Some(true),
            schedule_of_loads_compliant: Some(true),
            resolution: None,
            resolved_at: None,
            audit_trail: Vec::new(),
        }
    }

    #[test]
    fn test_merge_takes_newer_side() {
        let c = conflict((10.0, 100), (12.0, 200));
        let resolved = decide(&c, ResolutionStrategy::Merge).unwrap();
        assert_eq!(resolved, ResolvedValue::ScheduleOfLoads(12.0));
        assert_eq!(resolved.value(), 12.0);

        let c = conflict((10.0, 300), (12.0, 200));
        assert_eq!(decide(&c, ResolutionStrategy::Merge).unwrap().value(), 10.0);
    }

    #[test]
    fn test_merge_tie_goes_to_voltage_drop() {
        let c = conflict((10.0, 200), (12.0, 200));
        assert_eq!(
            decide(&c, ResolutionStrategy::Merge).unwrap(),
            ResolvedValue::VoltageDrop(10.0)
        );
    }

    #[test]
    fn test_manual_value_validation() {
        let c = conflict((10.0, 100), (12.0, 200));
        assert_eq!(decide(&c, ResolutionStrategy::Manual(2.5)).unwrap().value(), 2.5);
        assert!(matches!(
            decide(&c, ResolutionStrategy::Manual(f64::NAN)),
            Err(ConflictResolutionError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_batch_counts() {
        let mut batch = BatchResolution::default();
        batch.record("a", Ok(()));
        batch.record("b", Err(ConflictResolutionError::NotFound("b".to_string())));
        batch.record("c", Ok(()));
        assert_eq!(batch.success_count(), 2);
        assert_eq!(batch.failure_count(), 1);
        assert_eq!(batch.failed[0].conflict_id, "b");
    }
}
