use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::state::{derive, result_for_percent, ChangeSet, EngineState, NativeRecords};
use super::status::{CircuitChange, SyncOutcome, SyncStats, SyncStatus, UpsertOutcome};
use crate::calc::{ComplianceChecker, PecCalculator, VoltageDropCalculator};
use crate::circuit::*;
use crate::conflict::{
    decide, BatchResolution, Conflict, ConflictDetector, ConflictResolutionError, ConflictType, DetectionScope,
    ResolutionStrategy, ResolvedValue,
};
use crate::core::SyncConfig;
use crate::events::{EventFilter, EventPage, EventSource, SyncCompletion, SyncEventKind, SyncEventLog, UpdateReason};
use crate::recalc::{CircuitRecalculator, RecalculationError};
use crate::store::{CalculationKind, CalculationStore, StoreError};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Why a sync pass failed
#[derive(Debug, Error)]
pub enum SyncFailure {
    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Timed out after {0:?} reading saved calculations")]
    Timeout(Duration),
}

struct StatusCell {
    status: SyncStatus,
    in_flight: usize,
}

struct EngineInner {
    config: SyncConfig,
    state: RwLock<EngineState>,
    log: SyncEventLog,
    status: Mutex<StatusCell>,
    store: Arc<dyn CalculationStore>,
    calculator: Arc<dyn VoltageDropCalculator>,
    compliance: Arc<dyn ComplianceChecker>,
    detector: ConflictDetector,
    changes: broadcast::Sender<CircuitChange>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
    clock: AtomicI64,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_sync.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

struct PassSummary {
    circuits: usize,
    conflicts: usize,
}

/// Keeps the Schedule of Loads and Voltage Drop calculators consistent.
///
/// One engine per audit session; clones share the same state. All canonical
/// writes go through a single write lock, so passes and edits never
/// interleave.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Engine using the bundled PEC calculator
    pub fn new(config: SyncConfig, store: Arc<dyn CalculationStore>) -> Self {
        let pec = Arc::new(PecCalculator::new());
        Self::with_calculators(config, store, pec.clone(), pec)
    }

    pub fn with_calculators(
        config: SyncConfig,
        store: Arc<dyn CalculationStore>,
        calculator: Arc<dyn VoltageDropCalculator>,
        compliance: Arc<dyn ComplianceChecker>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let status = SyncStatus {
            is_enabled: config.enabled,
            auto_sync: config.auto_sync,
            ..SyncStatus::default()
        };
        let engine = Self {
            inner: Arc::new(EngineInner {
                log: SyncEventLog::new(config.retention.clone()),
                detector: ConflictDetector::new(config.thresholds.clone()),
                config,
                state: RwLock::new(EngineState::default()),
                status: Mutex::new(StatusCell { status, in_flight: 0 }),
                store,
                calculator,
                compliance,
                changes,
                auto_sync: Mutex::new(None),
                clock: AtomicI64::new(0),
            }),
        };
        engine.refresh_auto_sync();
        engine
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    fn status_cell(&self) -> MutexGuard<'_, StatusCell> {
        self.inner.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SyncStatus {
        self.status_cell().status.clone()
    }

    pub async fn stats(&self) -> SyncStats {
        self.inner.state.read().await.stats()
    }

    pub fn event_log(&self) -> &SyncEventLog {
        &self.inner.log
    }

    pub fn get_sync_events(&self, filter: &EventFilter) -> EventPage {
        self.inner.log.query(filter)
    }

    /// Notifications of edits that change circuit values
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CircuitChange> {
        self.inner.changes.subscribe()
    }

    pub async fn circuits(&self) -> Vec<UnifiedCircuitData> {
        self.inner.state.read().await.circuits.values().cloned().collect()
    }

    pub async fn circuit(&self, circuit_id: &str) -> Option<UnifiedCircuitData> {
        self.inner.state.read().await.circuits.get(circuit_id).cloned()
    }

    pub async fn get_load_schedule_by_id(&self, schedule_id: &str) -> Option<LoadSchedule> {
        self.inner.state.read().await.native.schedules.get(schedule_id).cloned()
    }

    pub async fn voltage_drop_record(&self, record_id: &str) -> Option<VoltageDropRecord> {
        self.inner.state.read().await.native.voltage_drop.get(record_id).cloned()
    }

    pub async fn topology_stats(&self) -> TopologyStats {
        self.inner.state.read().await.topology.stats()
    }

    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.inner.state.read().await.conflicts.all().to_vec()
    }

    pub async fn unresolved_conflicts(&self) -> Vec<Conflict> {
        self.inner
            .state
            .read()
            .await
            .conflicts
            .unresolved()
            .cloned()
            .collect()
    }

    /// Reset dirty tracking
    pub async fn clear_changes(&self) {
        self.inner.state.write().await.changed.clear();
    }

    pub fn enable_sync(&self, enabled: bool) {
        self.status_cell().status.is_enabled = enabled;
        info!("Sync {}", if enabled { "enabled" } else { "disabled" });
        self.refresh_auto_sync();
    }

    pub fn set_auto_sync(&self, auto_sync: bool) {
        self.status_cell().status.auto_sync = auto_sync;
        self.refresh_auto_sync();
    }

    pub fn is_auto_sync_running(&self) -> bool {
        self.auto_sync_slot().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn auto_sync_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.auto_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start or stop the periodic sync task to match the current status
    fn refresh_auto_sync(&self) {
        let should_run = {
            let cell = self.status_cell();
            cell.status.is_enabled && cell.status.auto_sync
        };

        let mut slot = self.auto_sync_slot();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        if !should_run {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Auto sync requested outside a Tokio runtime, not started");
            return;
        };
        let period = self.inner.config.auto_sync_interval();
        let weak = Arc::downgrade(&self.inner);
        debug!("Auto sync every {:?}", period);
        *slot = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                SyncEngine { inner }.sync_now(false).await;
            }
        }));
    }

    /// Monotonic epoch-millisecond stamp for records the engine writes
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.inner.clock.load(Ordering::SeqCst);
        loop {
            let next = if now > prev { now } else { prev + 1 };
            match self
                .inner
                .clock
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn broadcast(&self, circuit_ids: Vec<String>, source: EventSource) {
        if circuit_ids.is_empty() {
            return;
        }
        // No receivers is fine
        let _ = self.inner.changes.send(CircuitChange { circuit_ids, source });
    }

    /// Upsert a panel and all of its loads
    pub async fn update_load_schedule(&self, mut schedule: LoadSchedule) -> Result<ChangeSet, ConversionError> {
        if schedule.updated_at == 0 {
            schedule.updated_at = self.next_stamp();
        }
        let schedule_id = schedule.id.clone();
        let load_count = schedule.loads.len();

        let changes = {
            let mut state = self.inner.state.write().await;
            let mut native = state.native.clone();
            native.schedules.insert(schedule_id.clone(), schedule);
            let derived = derive(&native, &self.inner.config)?;

            self.inner.log.append(
                EventSource::ScheduleOfLoads,
                SyncEventKind::LoadScheduleUpdated {
                    schedule_id: schedule_id.clone(),
                    load_count,
                },
            );
            let changes = state.install(
                native,
                derived,
                EventSource::ScheduleOfLoads,
                UpdateReason::Edit,
                &self.inner.log,
            );
            let touched = changes.touched();
            let affected = state.affected_by(touched.iter().chain(&changes.deleted));
            state.detect(
                &self.inner.detector,
                DetectionScope::Incremental,
                Some(&affected),
                &self.inner.log,
            );
            changes
        };

        debug!(
            "Schedule {}: {} created, {} updated, {} deleted",
            schedule_id,
            changes.created.len(),
            changes.updated.len(),
            changes.deleted.len()
        );
        self.broadcast(changes.touched(), EventSource::ScheduleOfLoads);
        Ok(changes)
    }

    /// Upsert a single load. Loads naming an unknown schedule get a
    /// placeholder panel at the default voltage and power factor.
    pub async fn update_load_item(
        &self,
        mut item: LoadItem,
        schedule_id: Option<&str>,
    ) -> Result<UpsertOutcome, ConversionError> {
        if item.updated_at == 0 {
            item.updated_at = self.next_stamp();
        }
        let circuit_id = sol_circuit_id(schedule_id, &item.id);
        let load_id = item.id.clone();

        let changes = {
            let mut state = self.inner.state.write().await;
            let mut native = state.native.clone();
            match schedule_id {
                Some(sid) => {
                    let schedule = native.schedules.entry(sid.to_string()).or_insert_with(|| {
                        warn!("Load {} references unknown schedule {}, creating placeholder", load_id, sid);
                        LoadSchedule::new(
                            sid,
                            sid,
                            self.inner.config.default_system_voltage,
                            self.inner.config.default_power_factor,
                        )
                    });
                    match schedule.load_mut(&item.id) {
                        Some(existing) => *existing = item,
                        None => schedule.loads.push(item),
                    }
                }
                None => {
                    native.loose_items.insert(item.id.clone(), item);
                }
            }
            let derived = derive(&native, &self.inner.config)?;

            self.inner.log.append(
                EventSource::ScheduleOfLoads,
                SyncEventKind::LoadItemUpdated {
                    schedule_id: schedule_id.map(str::to_string),
                    load_id: load_id.clone(),
                    circuit_id: circuit_id.clone(),
                },
            );
            let changes = state.install(
                native,
                derived,
                EventSource::ScheduleOfLoads,
                UpdateReason::Edit,
                &self.inner.log,
            );
            let affected = state.affected_by(changes.touched().iter());
            state.detect(
                &self.inner.detector,
                DetectionScope::Incremental,
                Some(&affected),
                &self.inner.log,
            );
            changes
        };

        let outcome = upsert_outcome(&changes, &circuit_id);
        debug!("Load {} ({}): {:?}", load_id, circuit_id, outcome);
        self.broadcast(changes.touched(), EventSource::ScheduleOfLoads);
        Ok(outcome)
    }

    /// Upsert a circuit saved by the Voltage Drop calculator
    pub async fn update_voltage_drop_record(
        &self,
        mut record: VoltageDropRecord,
    ) -> Result<UpsertOutcome, ConversionError> {
        let circuit_id = voltage_drop_record_to_unified_circuit(&record)?.id;
        if record.updated_at == 0 {
            record.updated_at = self.next_stamp();
        }

        let changes = {
            let mut state = self.inner.state.write().await;
            let mut native = state.native.clone();
            native.voltage_drop.insert(record.id.clone(), record);
            let derived = derive(&native, &self.inner.config)?;

            let changes = state.install(
                native,
                derived,
                EventSource::VoltageDrop,
                UpdateReason::Edit,
                &self.inner.log,
            );
            let affected = state.affected_by(changes.touched().iter());
            state.detect(
                &self.inner.detector,
                DetectionScope::Incremental,
                Some(&affected),
                &self.inner.log,
            );
            changes
        };

        self.broadcast(changes.touched(), EventSource::VoltageDrop);
        Ok(upsert_outcome(&changes, &circuit_id))
    }

    /// Pull saved calculations from the store and rebuild the canonical map.
    ///
    /// Never fails: errors are recorded in the `sync-completed` event and in
    /// `SyncStatus::sync_error`. A no-op while sync is disabled.
    pub async fn sync_now(&self, manual: bool) -> SyncOutcome {
        if !self.status().is_enabled {
            debug!("Sync disabled, skipping pass");
            return SyncOutcome::skipped();
        }

        {
            let mut cell = self.status_cell();
            cell.in_flight += 1;
            cell.status.is_syncing = true;
        }
        let source = if manual { EventSource::User } else { EventSource::System };
        self.inner.log.append(source, SyncEventKind::SyncRequested { manual });

        let started = Instant::now();
        let result = self.run_pass().await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = match result {
            Ok(pass) => {
                info!(
                    "Sync pass complete: {} circuits, {} conflicts in {} ms",
                    pass.circuits, pass.conflicts, duration_ms
                );
                SyncOutcome {
                    successful: true,
                    skipped: false,
                    duration_ms,
                    circuits_processed: pass.circuits,
                    conflicts_detected: pass.conflicts,
                    error: None,
                }
            }
            Err(e) => {
                error!("Sync pass failed: {}", e);
                SyncOutcome {
                    successful: false,
                    skipped: false,
                    duration_ms,
                    circuits_processed: 0,
                    conflicts_detected: 0,
                    error: Some(e.to_string()),
                }
            }
        };

        self.inner.log.append(
            source,
            SyncEventKind::SyncCompleted(SyncCompletion {
                successful: outcome.successful,
                duration_ms,
                circuits_processed: outcome.circuits_processed,
                conflicts_detected: outcome.conflicts_detected,
                error: outcome.error.clone(),
            }),
        );

        let mut cell = self.status_cell();
        cell.in_flight = cell.in_flight.saturating_sub(1);
        cell.status.is_syncing = cell.in_flight > 0;
        if outcome.successful {
            cell.status.last_sync_time = Some(Utc::now());
            cell.status.sync_error = None;
        } else {
            cell.status.sync_error = outcome.error.clone();
        }
        drop(cell);

        outcome
    }

    async fn run_pass(&self) -> Result<PassSummary, SyncFailure> {
        let (saved_schedules, saved_records) = self.load_saved().await?;

        let (summary, touched) = {
            let mut state = self.inner.state.write().await;
            let mut native = state.native.clone();
            for schedule in saved_schedules {
                merge_newest(&mut native.schedules, schedule.id.clone(), schedule, LoadSchedule::latest_update);
            }
            for record in saved_records {
                merge_newest(&mut native.voltage_drop, record.id.clone(), record, |r| r.updated_at);
            }
            let derived = derive(&native, &self.inner.config)?;

            let changes = state.install(
                native,
                derived,
                EventSource::System,
                UpdateReason::Sync,
                &self.inner.log,
            );
            let detection = state.detect(
                &self.inner.detector,
                DetectionScope::FullSync,
                None,
                &self.inner.log,
            );
            state.synced = state.circuits.len();
            (
                PassSummary {
                    circuits: state.circuits.len(),
                    conflicts: detection.found,
                },
                changes.touched(),
            )
        };

        self.broadcast(touched, EventSource::System);
        Ok(summary)
    }

    /// Read both calculation kinds, bounded by the configured timeout
    async fn load_saved(&self) -> Result<(Vec<LoadSchedule>, Vec<VoltageDropRecord>), SyncFailure> {
        let timeout = self.inner.config.sync_timeout();
        let store = &self.inner.store;
        let read = async {
            let schedules = store.load_saved_calculations(CalculationKind::ScheduleOfLoads).await?;
            let records = store.load_saved_calculations(CalculationKind::VoltageDrop).await?;
            Ok::<_, StoreError>((schedules, records))
        };
        let (schedules, records) = tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| SyncFailure::Timeout(timeout))??;

        let schedules = schedules
            .into_iter()
            .map(|saved| serde_json::from_value::<LoadSchedule>(saved.data))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        let records = records
            .into_iter()
            .map(|saved| serde_json::from_value::<VoltageDropRecord>(saved.data))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok((schedules, records))
    }

    /// Settle one conflict, writing the chosen value to both calculators'
    /// records and persisting them.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<(), ConflictResolutionError> {
        let stamp = self.next_stamp();

        let (to_persist, touched) = {
            let mut state = self.inner.state.write().await;
            let conflict = state.conflicts.open(conflict_id)?.clone();
            let resolved = decide(&conflict, strategy)?;

            let missing = |circuit_id: &str| ConflictResolutionError::TargetMissing {
                conflict_id: conflict.id.clone(),
                circuit_id: circuit_id.to_string(),
            };
            let record_id = state
                .vd_refs
                .get(&conflict.circuit_id)
                .cloned()
                .ok_or_else(|| missing(&conflict.circuit_id))?;
            let sol_ref = state
                .sol_refs
                .get(&conflict.counterpart_id)
                .cloned()
                .ok_or_else(|| missing(&conflict.counterpart_id))?;

            let mut native = state.native.clone();
            let sol_result = native.sol_result(&sol_ref);
            let record = native
                .voltage_drop
                .get_mut(&record_id)
                .ok_or_else(|| missing(&conflict.circuit_id))?;
            record.updated_at = stamp;
            let fallback_length = record.inputs.conductor_length;

            let sol_written = match conflict.conflict_type {
                ConflictType::VoltageDropMismatch => {
                    let voltage = record.inputs.system_voltage;
                    let result = match resolved {
                        ResolvedValue::VoltageDrop(v) => record.results.clone().unwrap_or_else(|| result_for_percent(v, voltage)),
                        ResolvedValue::ScheduleOfLoads(v) => sol_result.unwrap_or_else(|| result_for_percent(v, voltage)),
                        ResolvedValue::Manual(v) => result_for_percent(v, voltage),
                    };
                    record.results = Some(result.clone());
                    native.apply_sol_result(&sol_ref, &result, fallback_length, None, Some(stamp))
                }
                ConflictType::ConductorLengthMismatch => {
                    record.inputs.conductor_length = resolved.value();
                    native.set_sol_length(&sol_ref, resolved.value(), stamp)
                }
            };
            if !sol_written {
                return Err(missing(&conflict.counterpart_id));
            }

            let derived = derive(&native, &self.inner.config)?;
            let mut to_persist: Vec<(CalculationKind, String, serde_json::Value)> = Vec::new();
            if let Some(schedule) = native.schedule_of(&sol_ref) {
                to_persist.extend(persistable(CalculationKind::ScheduleOfLoads, &schedule.id, schedule));
            }
            if let Some(record) = native.voltage_drop.get(&record_id) {
                to_persist.extend(persistable(CalculationKind::VoltageDrop, &record.id, record));
            }

            let changes = state.install(
                native,
                derived,
                EventSource::User,
                UpdateReason::Resolution,
                &self.inner.log,
            );

            let resolved_conflict = state.conflicts.mark_resolved(conflict_id, strategy, Utc::now())?;
            let trail = resolved_conflict.audit_trail.clone();
            for seq in trail {
                self.inner.log.unpin(seq);
            }
            let seq = self.inner.log.append(
                EventSource::User,
                SyncEventKind::ConflictResolved {
                    conflict_id: conflict.id.clone(),
                    circuit_id: conflict.circuit_id.clone(),
                    strategy,
                },
            );
            if let Some(c) = state.conflicts.get_mut(conflict_id) {
                c.audit_trail.push(seq);
            }

            let affected = state.affected_by([&conflict.circuit_id, &conflict.counterpart_id]);
            state.detect(
                &self.inner.detector,
                DetectionScope::Incremental,
                Some(&affected),
                &self.inner.log,
            );
            info!(
                "Resolved {} on {} with {} ({})",
                conflict.conflict_type,
                conflict.circuit_id,
                strategy,
                resolved.value()
            );
            (to_persist, changes.touched())
        };

        for (kind, name, data) in to_persist {
            if let Err(e) = self.inner.store.save_calculation(kind, &name, data).await {
                warn!("Failed to persist {} {} after resolution: {}", kind.as_str(), name, e);
            }
        }
        self.broadcast(touched, EventSource::User);
        Ok(())
    }

    /// Resolve several conflicts with one strategy; each succeeds or fails alone
    pub async fn resolve_conflicts(&self, conflict_ids: &[String], strategy: ResolutionStrategy) -> BatchResolution {
        let mut batch = BatchResolution::default();
        for id in conflict_ids {
            let result = self.resolve_conflict(id, strategy).await;
            if let Err(e) = &result {
                warn!("Could not resolve conflict {}: {}", id, e);
            }
            batch.record(id, result);
        }
        batch
    }

    /// Run the voltage drop calculator for one circuit and store the derived
    /// fields on its native record. Does not notify change subscribers.
    pub async fn recalculate_circuit(&self, circuit_id: &str) -> Result<(), RecalculationError> {
        let circuit = self
            .circuit(circuit_id)
            .await
            .ok_or_else(|| RecalculationError::UnknownCircuit(circuit_id.to_string()))?;
        let inputs = unified_circuit_to_voltage_drop_inputs(&circuit)?;
        let result = self.inner.calculator.calculate(&inputs)?;
        let optimal = self.inner.calculator.find_optimal_conductor_size(&inputs);

        let mut state = self.inner.state.write().await;
        let unknown = || RecalculationError::UnknownCircuit(circuit_id.to_string());
        let mut native = state.native.clone();

        match circuit.source {
            CircuitSource::VoltageDrop => {
                let record_id = state.vd_refs.get(circuit_id).ok_or_else(unknown)?;
                let record = native.voltage_drop.get_mut(record_id).ok_or_else(unknown)?;
                record.results = Some(result.clone());
                if optimal.is_some() {
                    record.optimal_conductor_size = optimal.clone();
                }
            }
            CircuitSource::ScheduleOfLoads => {
                let sol_ref = state.sol_refs.get(circuit_id).cloned().ok_or_else(unknown)?;
                if !native.apply_sol_result(&sol_ref, &result, inputs.conductor_length, optimal.as_deref(), None) {
                    return Err(unknown());
                }
                if let Some(schedule) = native.schedule_of(&sol_ref) {
                    let refreshed = self.inner.compliance.update_load_schedule_compliance(schedule);
                    native.schedules.insert(refreshed.id.clone(), refreshed);
                }
            }
        }

        let derived = derive(&native, &self.inner.config)?;
        let changes = state.install(
            native,
            derived,
            EventSource::System,
            UpdateReason::Recalculation,
            &self.inner.log,
        );
        let affected = state.affected_by([&circuit_id.to_string()]);
        state.detect(
            &self.inner.detector,
            DetectionScope::Incremental,
            Some(&affected),
            &self.inner.log,
        );
        debug!(
            "Recalculated {}: {:.2}% drop, {} circuits changed",
            circuit_id,
            result.voltage_drop_percent,
            changes.touched().len()
        );
        Ok(())
    }
}

#[async_trait]
impl CircuitRecalculator for SyncEngine {
    async fn recalculate(&self, circuit_id: &str) -> Result<(), RecalculationError> {
        self.recalculate_circuit(circuit_id).await
    }
}

fn upsert_outcome(changes: &ChangeSet, circuit_id: &str) -> UpsertOutcome {
    if changes.created.iter().any(|c| c == circuit_id) {
        UpsertOutcome::Created
    } else if changes.contains(circuit_id) {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Unchanged
    }
}

/// Keep whichever copy was edited last; ties keep the engine's copy
fn merge_newest<T>(snapshot: &mut BTreeMap<String, T>, id: String, incoming: T, stamp: impl Fn(&T) -> i64) -> bool {
    match snapshot.get(&id) {
        Some(existing) if stamp(existing) >= stamp(&incoming) => false,
        _ => {
            snapshot.insert(id, incoming);
            true
        }
    }
}

/// Serialized form of a record for the store; records that fail to
/// serialize are skipped
fn persistable<T: serde::Serialize>(
    kind: CalculationKind,
    name: &str,
    record: &T,
) -> Option<(CalculationKind, String, serde_json::Value)> {
    match serde_json::to_value(record) {
        Ok(data) => Some((kind, name.to_string(), data)),
        Err(e) => {
            warn!("Not saving {:?} record {}: {}", kind, name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn engine() -> SyncEngine {
        SyncEngine::new(SyncConfig::default(), Arc::new(MemoryStore::new()))
    }

    fn panel() -> LoadSchedule {
        LoadSchedule::new("P-1", "Panel 1", 230.0, 0.9)
            .with_load(LoadItem::new("L1", "Lighting", 10, 100.0).with_conductor("12 AWG", 20.0))
    }

    #[test]
    fn test_merge_newest() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 5i64);
        assert!(!merge_newest(&mut map, "a".to_string(), 5, |v| *v));
        assert!(!merge_newest(&mut map, "a".to_string(), 3, |v| *v));
        assert!(merge_newest(&mut map, "a".to_string(), 9, |v| *v));
        assert!(merge_newest(&mut map, "b".to_string(), 1, |v| *v));
        assert_eq!(map["a"], 9);
    }

    #[tokio::test]
    async fn test_update_load_schedule_creates_circuits() {
        let engine = engine();
        let changes = engine.update_load_schedule(panel()).await.unwrap();
        assert_eq!(changes.created, vec!["P-1".to_string(), "P-1-L1".to_string()]);

        let circuit = engine.circuit("P-1-L1").await.unwrap();
        assert_eq!(circuit.connected_load, 1000.0);
        assert_eq!(engine.stats().await.changed_circuits, 2);

        engine.clear_changes().await;
        assert_eq!(engine.stats().await.changed_circuits, 0);
        assert_eq!(engine.circuits().await.len(), 2);
    }

    #[tokio::test]
    async fn test_update_load_item_idempotent() {
        let engine = engine();
        engine.update_load_schedule(panel()).await.unwrap();
        let item = LoadItem::new("L2", "Receptacles", 4, 180.0).with_updated_at(10);

        assert_eq!(
            engine.update_load_item(item.clone(), Some("P-1")).await.unwrap(),
            UpsertOutcome::Created
        );
        let updates_before = engine.event_log().count(crate::events::SyncEventType::CircuitUpdated);
        assert_eq!(
            engine.update_load_item(item, Some("P-1")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            engine.event_log().count(crate::events::SyncEventType::CircuitUpdated),
            updates_before
        );
        assert_eq!(engine.circuits().await.len(), 3);
    }

    #[tokio::test]
    async fn test_recalculate_writes_native_record() {
        let engine = engine();
        engine.update_load_schedule(panel()).await.unwrap();
        engine.recalculate_circuit("P-1-L1").await.unwrap();

        let schedule = engine.get_load_schedule_by_id("P-1").await.unwrap();
        let results = schedule.load("L1").unwrap().voltage_drop_results.clone().unwrap();
        let circuit = engine.circuit("P-1-L1").await.unwrap();
        assert_eq!(circuit.voltage_drop_percent, Some(results.voltage_drop_percent));
        assert!(schedule.is_pec_compliant.is_some());

        assert!(matches!(
            engine.recalculate_circuit("missing").await,
            Err(RecalculationError::UnknownCircuit(_))
        ));
    }

    #[tokio::test]
    async fn test_recalculate_rejects_incomplete_circuit() {
        let engine = engine();
        engine
            .update_load_item(LoadItem::new("L9", "Spare", 1, 100.0), None)
            .await
            .unwrap();
        assert!(matches!(
            engine.recalculate_circuit("L9").await,
            Err(RecalculationError::Conversion(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_sync_is_noop() {
        let engine = engine();
        engine.enable_sync(false);
        let outcome = engine.sync_now(true).await;
        assert!(outcome.skipped);
        assert!(engine.event_log().is_empty());
    }

    #[test]
    fn test_unserializable_record_is_not_persisted() {
        struct Broken;
        impl serde::Serialize for Broken {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("broken record"))
            }
        }

        assert!(persistable(CalculationKind::VoltageDrop, "run-1", &Broken).is_none());
        let (kind, name, data) = persistable(CalculationKind::ScheduleOfLoads, "P-1", &panel()).unwrap();
        assert_eq!(kind, CalculationKind::ScheduleOfLoads);
        assert_eq!(name, "P-1");
        assert_eq!(data["id"], "P-1");
    }

    #[test]
    fn test_auto_sync_outside_runtime_is_not_started() {
        let config = SyncConfig {
            auto_sync: true,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(config, Arc::new(MemoryStore::new()));
        assert!(engine.status().auto_sync);
        assert!(!engine.is_auto_sync_running());
    }
}
