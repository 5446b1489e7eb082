//! Engine state and the pure steps a write goes through: derive the
//! canonical map from native records, install it with a diff, re-run
//! conflict detection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::calc::PEC_MAX_VOLTAGE_DROP_PERCENT;
use crate::circuit::*;
use crate::conflict::{
    CircuitComparison, ConflictChange, ConflictDetector, ConflictService, DetectionScope, SideSnapshot,
};
use crate::core::SyncConfig;
use crate::events::{EventSource, SyncEventKind, SyncEventLog, UpdateReason};

use super::status::SyncStats;

/// Native records held by the engine, keyed by native id
#[derive(Debug, Clone, Default)]
pub(crate) struct NativeRecords {
    pub schedules: BTreeMap<String, LoadSchedule>,
    /// Loads saved without a panel
    pub loose_items: BTreeMap<String, LoadItem>,
    pub voltage_drop: BTreeMap<String, VoltageDropRecord>,
}

/// Where a Schedule of Loads circuit lives in the native records
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SolRef {
    Panel(String),
    Load { schedule_id: String, load_id: String },
    Loose(String),
}

#[derive(Debug, Default)]
pub(crate) struct Derived {
    circuits: BTreeMap<String, UnifiedCircuitData>,
    topology: CircuitTopology,
    sol_refs: HashMap<String, SolRef>,
    vd_refs: HashMap<String, String>,
}

/// Build the complete canonical map from native records
pub(crate) fn derive(native: &NativeRecords, config: &SyncConfig) -> Result<Derived, ConversionError> {
    let mut derived = Derived::default();

    for schedule in native.schedules.values() {
        let panel = load_schedule_to_unified_circuit(schedule);
        derived.topology.add_circuit(&panel);
        derived.sol_refs.insert(panel.id.clone(), SolRef::Panel(schedule.id.clone()));
        derived.circuits.insert(panel.id.clone(), panel);

        let voltage = positive_or(schedule.voltage, config.default_system_voltage);
        let power_factor = positive_or(schedule.power_factor, config.default_power_factor);
        for load in &schedule.loads {
            let circuit = load_item_to_unified_circuit(
                load,
                Some(&schedule.id),
                voltage,
                power_factor,
                schedule.phase_configuration,
            );
            derived.topology.add_circuit(&circuit);
            derived.topology.connect_feeder(&schedule.id, &circuit.id);
            derived.sol_refs.insert(
                circuit.id.clone(),
                SolRef::Load {
                    schedule_id: schedule.id.clone(),
                    load_id: load.id.clone(),
                },
            );
            derived.circuits.insert(circuit.id.clone(), circuit);
        }
    }

    for item in native.loose_items.values() {
        let circuit = load_item_to_unified_circuit(
            item,
            None,
            config.default_system_voltage,
            config.default_power_factor,
            PhaseConfiguration::SinglePhase,
        );
        if derived.circuits.contains_key(&circuit.id) {
            warn!("Load {} collides with an existing circuit id, skipping", item.id);
            continue;
        }
        derived.topology.add_circuit(&circuit);
        derived.sol_refs.insert(circuit.id.clone(), SolRef::Loose(item.id.clone()));
        derived.circuits.insert(circuit.id.clone(), circuit);
    }

    for record in native.voltage_drop.values() {
        let circuit = voltage_drop_record_to_unified_circuit(record)?;
        derived.topology.add_circuit(&circuit);
        derived.vd_refs.insert(circuit.id.clone(), record.id.clone());
        if let Some(linked) = &record.linked_circuit_id {
            if !derived.topology.link_analysis(&circuit.id, linked) {
                debug!("Voltage drop circuit {} links to unknown circuit {}", circuit.id, linked);
            }
        }
        derived.circuits.insert(circuit.id.clone(), circuit);
    }

    Ok(derived)
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        fallback
    }
}

/// Canonical circuits created, changed and removed by one write
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Circuits that exist after the write and whose values changed
    pub fn touched(&self) -> Vec<String> {
        self.created.iter().chain(&self.updated).cloned().collect()
    }

    pub fn contains(&self, circuit_id: &str) -> bool {
        self.created.iter().chain(&self.updated).any(|c| c == circuit_id)
    }
}

#[derive(Debug, Default)]
pub(crate) struct DetectionSummary {
    /// Disagreements found, new or already tracked
    pub found: usize,
    pub opened: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    pub native: NativeRecords,
    pub circuits: BTreeMap<String, UnifiedCircuitData>,
    pub topology: CircuitTopology,
    pub sol_refs: HashMap<String, SolRef>,
    pub vd_refs: HashMap<String, String>,
    pub conflicts: ConflictService,
    pub changed: BTreeSet<String>,
    pub synced: usize,
}

impl EngineState {
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            changed_circuits: self.changed.len(),
            synced_circuits: self.synced,
            conflicts: self.conflicts.unresolved_count(),
        }
    }

    /// Swap in a freshly derived canonical map, logging each difference
    pub fn install(
        &mut self,
        native: NativeRecords,
        derived: Derived,
        source: EventSource,
        reason: UpdateReason,
        log: &SyncEventLog,
    ) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for (id, circuit) in &derived.circuits {
            match self.circuits.get(id) {
                None => changes.created.push(id.clone()),
                Some(old) if old.differs_from(circuit) => changes.updated.push(id.clone()),
                Some(_) => {}
            }
        }
        for id in self.circuits.keys() {
            if !derived.circuits.contains_key(id) {
                changes.deleted.push(id.clone());
            }
        }

        for id in &changes.created {
            log.append(source, SyncEventKind::CircuitCreated { circuit_id: id.clone() });
        }
        for id in &changes.updated {
            log.append(
                source,
                SyncEventKind::CircuitUpdated {
                    circuit_id: id.clone(),
                    reason,
                },
            );
        }
        for id in &changes.deleted {
            log.append(source, SyncEventKind::CircuitDeleted { circuit_id: id.clone() });
        }

        self.changed.extend(changes.created.iter().cloned());
        self.changed.extend(changes.updated.iter().cloned());
        self.changed.extend(changes.deleted.iter().cloned());

        self.native = native;
        self.circuits = derived.circuits;
        self.topology = derived.topology;
        self.sol_refs = derived.sol_refs;
        self.vd_refs = derived.vd_refs;
        changes
    }

    /// Every circuit an edit to `ids` can influence
    pub fn affected_by<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
        ids.into_iter()
            .flat_map(|id| self.topology.affected_by(id))
            .collect()
    }

    /// Compare linked pairs and fold the findings into the conflict list.
    /// With `scope_ids`, only pairs touching one of those circuits are compared.
    pub fn detect(
        &mut self,
        detector: &ConflictDetector,
        scope: DetectionScope,
        scope_ids: Option<&BTreeSet<String>>,
        log: &SyncEventLog,
    ) -> DetectionSummary {
        let comparisons: Vec<CircuitComparison> = self
            .circuits
            .values()
            .filter(|c| c.source == CircuitSource::VoltageDrop)
            .filter_map(|vd| {
                let counterpart_id = self.topology.counterpart_of(&vd.id)?;
                if let Some(ids) = scope_ids {
                    if !ids.contains(&vd.id) && !ids.contains(counterpart_id) {
                        return None;
                    }
                }
                let sol = self.circuits.get(counterpart_id)?;
                Some(CircuitComparison {
                    circuit_id: vd.id.clone(),
                    counterpart_id: sol.id.clone(),
                    name: vd.description.clone(),
                    voltage_drop: snapshot(vd),
                    schedule_of_loads: snapshot(sol),
                })
            })
            .collect();

        let findings = detector.detect(&comparisons);
        let found = findings.len();
        let mut summary = DetectionSummary {
            found,
            opened: Vec::new(),
        };

        for change in self.conflicts.reconcile(findings, scope) {
            let ConflictChange::Opened(conflict_id) = change else {
                continue;
            };
            let Some(conflict) = self.conflicts.get_mut(&conflict_id) else {
                continue;
            };
            info!(
                "{} conflict on {} ({}): {:.2}{} vs {:.2}{}",
                conflict.severity,
                conflict.circuit_id,
                conflict.conflict_type,
                conflict.voltage_drop_source.value,
                conflict.conflict_type.unit(),
                conflict.schedule_of_loads_source.value,
                conflict.conflict_type.unit(),
            );
            let seq = log.append(
                EventSource::System,
                SyncEventKind::ConflictDetected {
                    conflict_id: conflict.id.clone(),
                    circuit_id: conflict.circuit_id.clone(),
                    severity: conflict.severity,
                },
            );
            log.pin(seq);
            conflict.audit_trail.push(seq);
            summary.opened.push(conflict_id);
        }

        summary
    }
}

fn snapshot(circuit: &UnifiedCircuitData) -> SideSnapshot {
    SideSnapshot {
        voltage_drop_percent: circuit.voltage_drop_percent,
        conductor_length: circuit.conductor_length,
        is_compliant: circuit.is_pec_compliant,
        timestamp: circuit.last_updated,
    }
}

impl NativeRecords {
    /// Voltage drop results held by a Schedule of Loads record
    pub fn sol_result(&self, sol_ref: &SolRef) -> Option<VoltageDropResult> {
        match sol_ref {
            SolRef::Panel(schedule_id) => {
                let s = self.schedules.get(schedule_id)?;
                let pct = s.voltage_drop_percent?;
                Some(VoltageDropResult {
                    voltage_drop_percent: pct,
                    voltage_drop: s.voltage_drop.unwrap_or(s.voltage * pct / 100.0),
                    receiving_end_voltage: s.receiving_end_voltage.unwrap_or(s.voltage * (1.0 - pct / 100.0)),
                    is_compliant: s.is_pec_compliant.unwrap_or(pct <= PEC_MAX_VOLTAGE_DROP_PERCENT),
                    max_allowed_drop_percent: PEC_MAX_VOLTAGE_DROP_PERCENT,
                })
            }
            SolRef::Load { schedule_id, load_id } => self
                .schedules
                .get(schedule_id)?
                .load(load_id)?
                .voltage_drop_results
                .clone(),
            SolRef::Loose(load_id) => self.loose_items.get(load_id)?.voltage_drop_results.clone(),
        }
    }

    /// Write voltage drop results onto a Schedule of Loads record. Returns
    /// false if the record no longer exists.
    pub fn apply_sol_result(
        &mut self,
        sol_ref: &SolRef,
        result: &VoltageDropResult,
        fallback_length: f64,
        optimal: Option<&str>,
        stamp: Option<i64>,
    ) -> bool {
        match sol_ref {
            SolRef::Panel(schedule_id) => {
                let Some(schedule) = self.schedules.get_mut(schedule_id) else {
                    return false;
                };
                let mut updated = update_load_schedule_with_voltage_drop_results(
                    schedule,
                    result.voltage_drop_percent,
                    result.voltage_drop,
                    result.receiving_end_voltage,
                    result.is_compliant,
                    schedule.conductor_length.unwrap_or(fallback_length),
                    optimal,
                );
                if let Some(stamp) = stamp {
                    updated.updated_at = stamp;
                }
                *schedule = updated;
                true
            }
            SolRef::Load { schedule_id, load_id } => {
                let Some(item) = self
                    .schedules
                    .get_mut(schedule_id)
                    .and_then(|s| s.load_mut(load_id))
                else {
                    return false;
                };
                apply_item_result(item, result, fallback_length, optimal, stamp);
                true
            }
            SolRef::Loose(load_id) => {
                let Some(item) = self.loose_items.get_mut(load_id) else {
                    return false;
                };
                apply_item_result(item, result, fallback_length, optimal, stamp);
                true
            }
        }
    }

    /// Set the conductor length of a Schedule of Loads record
    pub fn set_sol_length(&mut self, sol_ref: &SolRef, length: f64, stamp: i64) -> bool {
        match sol_ref {
            SolRef::Panel(schedule_id) => match self.schedules.get_mut(schedule_id) {
                Some(schedule) => {
                    schedule.conductor_length = Some(length);
                    schedule.updated_at = stamp;
                    true
                }
                None => false,
            },
            SolRef::Load { schedule_id, load_id } => {
                match self.schedules.get_mut(schedule_id).and_then(|s| s.load_mut(load_id)) {
                    Some(item) => {
                        item.conductor_length = Some(length);
                        item.updated_at = stamp;
                        true
                    }
                    None => false,
                }
            }
            SolRef::Loose(load_id) => match self.loose_items.get_mut(load_id) {
                Some(item) => {
                    item.conductor_length = Some(length);
                    item.updated_at = stamp;
                    true
                }
                None => false,
            },
        }
    }

    pub fn schedule_of(&self, sol_ref: &SolRef) -> Option<&LoadSchedule> {
        match sol_ref {
            SolRef::Panel(schedule_id) | SolRef::Load { schedule_id, .. } => self.schedules.get(schedule_id),
            SolRef::Loose(_) => None,
        }
    }
}

fn apply_item_result(
    item: &mut LoadItem,
    result: &VoltageDropResult,
    fallback_length: f64,
    optimal: Option<&str>,
    stamp: Option<i64>,
) {
    let mut updated = update_load_item_with_voltage_drop_results(
        item,
        result.voltage_drop_percent,
        result.voltage_drop,
        result.receiving_end_voltage,
        result.is_compliant,
        item.conductor_length.unwrap_or(fallback_length),
        optimal,
    );
    if let Some(stamp) = stamp {
        updated.updated_at = stamp;
    }
    *item = updated;
}

/// A result carrying only a chosen drop percentage
pub(crate) fn result_for_percent(voltage_drop_percent: f64, system_voltage: f64) -> VoltageDropResult {
    let voltage_drop = system_voltage * voltage_drop_percent / 100.0;
    VoltageDropResult {
        voltage_drop_percent,
        voltage_drop,
        receiving_end_voltage: system_voltage - voltage_drop,
        is_compliant: voltage_drop_percent <= PEC_MAX_VOLTAGE_DROP_PERCENT,
        max_allowed_drop_percent: PEC_MAX_VOLTAGE_DROP_PERCENT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native() -> NativeRecords {
        let schedule = LoadSchedule::new("P-1", "Panel 1", 230.0, 0.9)
            .with_feeder("8 AWG", 30.0)
            .with_load(LoadItem::new("L1", "Lighting", 10, 100.0).with_conductor("12 AWG", 20.0));
        let mut native = NativeRecords::default();
        native.schedules.insert(schedule.id.clone(), schedule);
        native
    }

    #[test]
    fn test_derive_builds_panel_and_loads() {
        let derived = derive(&native(), &SyncConfig::default()).unwrap();
        assert_eq!(derived.circuits.len(), 2);
        assert!(derived.circuits.contains_key("P-1"));
        assert_eq!(derived.circuits["P-1-L1"].connected_load, 1000.0);
        assert_eq!(derived.topology.feeder_of("P-1-L1"), Some("P-1"));
        assert_eq!(
            derived.sol_refs["P-1-L1"],
            SolRef::Load {
                schedule_id: "P-1".to_string(),
                load_id: "L1".to_string()
            }
        );
    }

    #[test]
    fn test_install_diffs_and_logs() {
        let log = SyncEventLog::default();
        let config = SyncConfig::default();
        let mut state = EngineState::default();

        let records = native();
        let changes = state.install(
            records.clone(),
            derive(&records, &config).unwrap(),
            EventSource::ScheduleOfLoads,
            UpdateReason::Edit,
            &log,
        );
        assert_eq!(changes.created.len(), 2);
        assert_eq!(state.stats().changed_circuits, 2);

        let changes = state.install(
            records.clone(),
            derive(&records, &config).unwrap(),
            EventSource::ScheduleOfLoads,
            UpdateReason::Edit,
            &log,
        );
        assert!(changes.is_empty());
        assert_eq!(log.len(), 2);

        let changes = state.install(
            NativeRecords::default(),
            derive(&NativeRecords::default(), &config).unwrap(),
            EventSource::System,
            UpdateReason::Sync,
            &log,
        );
        assert_eq!(changes.deleted.len(), 2);
        assert!(state.circuits.is_empty());
    }

    #[test]
    fn test_apply_sol_result_to_load() {
        let mut records = native();
        let sol_ref = SolRef::Load {
            schedule_id: "P-1".to_string(),
            load_id: "L1".to_string(),
        };
        assert!(records.sol_result(&sol_ref).is_none());

        let result = result_for_percent(2.0, 230.0);
        assert!(records.apply_sol_result(&sol_ref, &result, 25.0, None, Some(500)));
        let stored = records.sol_result(&sol_ref).unwrap();
        assert_eq!(stored.voltage_drop_percent, 2.0);
        let item = records.schedules["P-1"].load("L1").unwrap();
        assert_eq!(item.conductor_length, Some(20.0));
        assert_eq!(item.updated_at, 500);

        assert!(!records.apply_sol_result(&SolRef::Loose("x".to_string()), &result, 25.0, None, None));
    }

    #[test]
    fn test_result_for_percent() {
        let r = result_for_percent(4.0, 200.0);
        assert_eq!(r.voltage_drop, 8.0);
        assert_eq!(r.receiving_end_voltage, 192.0);
        assert!(!r.is_compliant);
    }
}
