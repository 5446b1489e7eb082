//! Conflict Detection and Tracking
//!
//! Compares each Voltage Drop circuit with the Schedule of Loads circuit it
//! analyses and keeps the resulting conflicts, one live conflict per
//! `(circuit, type)` key. Resolved conflicts stay in the list as history.

pub mod detector;
pub mod resolution;
pub mod types;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::circuit::ConversionError;

pub use detector::{CircuitComparison, ConflictDetector, ConflictFinding, ConflictThresholds, SideSnapshot};
pub use resolution::{decide, BatchResolution, FailedResolution, ResolvedValue};
pub use types::{Conflict, ConflictSeverity, ConflictType, ResolutionStrategy, SourceValue};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConflictResolutionError {
    #[error("Conflict not found: {0}")]
    NotFound(String),

    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(String),

    #[error("Conflict {conflict_id}: circuit {circuit_id} no longer exists")]
    TargetMissing { conflict_id: String, circuit_id: String },

    #[error("Invalid manual value: {0}")]
    InvalidValue(f64),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Whether detection runs as part of a sync pass or after a single edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionScope {
    /// A fresh sync pass; may open a new conflict for a previously resolved key
    FullSync,
    /// Calculator edit; never reopens a resolved key
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictChange {
    Opened(String),
    Updated(String),
}

#[derive(Debug, Clone, Default)]
pub struct ConflictService {
    conflicts: Vec<Conflict>,
}

impl ConflictService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold detector findings into the conflict list
    pub fn reconcile(&mut self, findings: Vec<ConflictFinding>, scope: DetectionScope) -> Vec<ConflictChange> {
        let now = Utc::now();
        let mut changes = Vec::new();

        for finding in findings {
            if let Some(open) = self.conflicts.iter_mut().find(|c| {
                !c.resolved && c.circuit_id == finding.circuit_id && c.conflict_type == finding.conflict_type
            }) {
                let changed = open.severity != finding.severity
                    || open.voltage_drop_source != finding.voltage_drop_source
                    || open.schedule_of_loads_source != finding.schedule_of_loads_source;
                if changed {
                    open.severity = finding.severity;
                    open.voltage_drop_source = finding.voltage_drop_source;
                    open.schedule_of_loads_source = finding.schedule_of_loads_source;
                    open.voltage_drop_compliant = finding.voltage_drop_compliant;
                    open.schedule_of_loads_compliant = finding.schedule_of_loads_compliant;
                    open.timestamp = now;
                    changes.push(ConflictChange::Updated(open.id.clone()));
                }
                continue;
            }

            let previously_resolved = self
                .conflicts
                .iter()
                .any(|c| c.resolved && c.circuit_id == finding.circuit_id && c.conflict_type == finding.conflict_type);
            if previously_resolved && scope == DetectionScope::Incremental {
                debug!(
                    "Skipping {} on {}: resolved, waiting for next sync",
                    finding.conflict_type, finding.circuit_id
                );
                continue;
            }

            let conflict = Conflict {
                id: uuid::Uuid::new_v4().to_string(),
                circuit_id: finding.circuit_id,
                counterpart_id: finding.counterpart_id,
                name: finding.name,
                conflict_type: finding.conflict_type,
                severity: finding.severity,
                timestamp: now,
                resolved: false,
                voltage_drop_source: finding.voltage_drop_source,
                schedule_of_loads_source: finding.schedule_of_loads_source,
                voltage_drop_compliant: finding.voltage_drop_compliant,
                schedule_of_loads_compliant: finding.schedule_of_loads_compliant,
                resolution: None,
                resolved_at: None,
                audit_trail: Vec::new(),
            };
            changes.push(ConflictChange::Opened(conflict.id.clone()));
            self.conflicts.push(conflict);
        }

        changes
    }

    pub fn all(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn get(&self, id: &str) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Conflict> {
        self.conflicts.iter_mut().find(|c| c.id == id)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    /// The conflict with `id`, provided it is still open
    pub fn open(&self, id: &str) -> Result<&Conflict, ConflictResolutionError> {
        let conflict = self
            .get(id)
            .ok_or_else(|| ConflictResolutionError::NotFound(id.to_string()))?;
        if conflict.resolved {
            return Err(ConflictResolutionError::AlreadyResolved(id.to_string()));
        }
        Ok(conflict)
    }

    pub fn mark_resolved(
        &mut self,
        id: &str,
        strategy: ResolutionStrategy,
        at: DateTime<Utc>,
    ) -> Result<&Conflict, ConflictResolutionError> {
        self.open(id)?;
        let conflict = self
            .get_mut(id)
            .ok_or_else(|| ConflictResolutionError::NotFound(id.to_string()))?;
        conflict.resolved = true;
        conflict.resolution = Some(strategy);
        conflict.resolved_at = Some(at);
        Ok(conflict)
    }
}
