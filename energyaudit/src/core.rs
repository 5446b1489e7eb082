//! Session wiring shared by the CLI and any embedding application.
//! Holds configuration, the umbrella error type and `AuditSession`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::circuit::{ConversionError, TopologyStats};
use crate::conflict::{Conflict, ConflictResolutionError, ConflictSeverity, ConflictThresholds};
use crate::events::{RetentionPolicy, MAX_RETENTION_DAYS};
use crate::recalc::{RecalculationError, RecalculationScheduler};
use crate::store::{CalculationKind, CalculationStore, StoreError};
use crate::sync::{SyncEngine, SyncOutcome, SyncStats};

#[derive(Debug, thiserror::Error)]
pub enum EnergyAuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Invalid calculation data: {0}")]
    Data(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Resolution(#[from] ConflictResolutionError),
    #[error(transparent)]
    Recalculation(#[from] RecalculationError),
}

/// Engine configuration. Every field has a default, so partial JSON files
/// are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub auto_sync: bool,
    pub auto_sync_interval_secs: u64,
    pub debounce_ms: u64,
    /// Upper bound on reading saved calculations during a sync pass
    pub sync_timeout_ms: u64,
    /// Used for loads saved without a panel
    pub default_system_voltage: f64,
    pub default_power_factor: f64,
    pub thresholds: ConflictThresholds,
    pub retention: RetentionPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_sync: false,
            auto_sync_interval_secs: 300,
            debounce_ms: 750,
            sync_timeout_ms: 10_000,
            default_system_voltage: 230.0,
            default_power_factor: 0.8,
            thresholds: ConflictThresholds::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, EnergyAuditError> {
        let text = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EnergyAuditError> {
        if !(self.default_system_voltage > 0.0) {
            return Err(EnergyAuditError::Config(
                "default_system_voltage must be positive".to_string(),
            ));
        }
        if !(self.default_power_factor > 0.0 && self.default_power_factor <= 1.0) {
            return Err(EnergyAuditError::Config(
                "default_power_factor must be in (0, 1]".to_string(),
            ));
        }
        if self.auto_sync_interval_secs == 0 {
            return Err(EnergyAuditError::Config(
                "auto_sync_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.retention.max_age_days.is_some_and(|days| days > MAX_RETENTION_DAYS) {
            return Err(EnergyAuditError::Config(format!(
                "retention.max_age_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        Ok(())
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// Summary of a session's state after a sync pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub stats: SyncStats,
    pub topology: TopologyStats,
    pub conflicts: Vec<Conflict>,
}

impl SyncReport {
    pub fn unresolved(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    /// True if any unresolved conflict is at least `severity`
    pub fn has_severity_at_least(&self, severity: ConflictSeverity) -> bool {
        self.unresolved().any(|c| c.severity >= severity)
    }

    pub fn count_by_severity(&self, severity: ConflictSeverity) -> usize {
        self.unresolved().filter(|c| c.severity == severity).count()
    }
}

/// One engine plus its recalculation scheduler, wired together.
///
/// Must be created from within a Tokio runtime.
pub struct AuditSession {
    engine: SyncEngine,
    scheduler: RecalculationScheduler,
    watcher: JoinHandle<()>,
}

impl AuditSession {
    pub fn new(config: SyncConfig, store: Arc<dyn CalculationStore>) -> Self {
        Self::with_engine(SyncEngine::new(config, store))
    }

    pub fn with_engine(engine: SyncEngine) -> Self {
        let scheduler = RecalculationScheduler::new(Arc::new(engine.clone()), engine.config().debounce());
        let watcher = scheduler.watch(engine.subscribe_changes());
        info!("Audit session started");
        Self {
            engine,
            scheduler,
            watcher,
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &RecalculationScheduler {
        &self.scheduler
    }

    /// Run a sync pass and collect the resulting state
    pub async fn sync(&self, manual: bool) -> SyncReport {
        let outcome = self.engine.sync_now(manual).await;
        self.report(outcome).await
    }

    pub async fn report(&self, outcome: SyncOutcome) -> SyncReport {
        SyncReport {
            outcome,
            stats: self.engine.stats().await,
            topology: self.engine.topology_stats().await,
            conflicts: self.engine.conflicts().await,
        }
    }

    /// Recalculate every circuit now, bypassing the debounce window.
    /// Returns the circuits that could not be recalculated.
    pub async fn recalculate_all(&self) -> Vec<(String, RecalculationError)> {
        let mut failures = Vec::new();
        for circuit in self.engine.circuits().await {
            if let Err(e) = self.engine.recalculate_circuit(&circuit.id).await {
                failures.push((circuit.id, e));
            }
        }
        failures
    }
}

impl Drop for AuditSession {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Load a JSON array of saved records into `store`, naming each by its `id`.
/// Returns the number of records imported.
pub async fn import_calculations(
    store: &dyn CalculationStore,
    kind: CalculationKind,
    path: &Path,
) -> Result<usize, EnergyAuditError> {
    let text = std::fs::read_to_string(path)?;
    let records: Vec<serde_json::Value> = serde_json::from_str(&text)?;
    let mut imported = 0;
    for record in records {
        let name = record
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                EnergyAuditError::Config(format!("{}: record without an \"id\"", path.display()))
            })?;
        store.save_calculation(kind, &name, record).await?;
        imported += 1;
    }
    info!("Imported {} {} records from {}", imported, kind.as_str(), path.display());
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"debounce_ms": 200, "thresholds": {{"voltage_drop_percent": 0.25}}}}"#).unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(200));
        assert_eq!(config.thresholds.voltage_drop_percent, 0.25);
        assert_eq!(config.thresholds.high_voltage_drop_percent, 1.0);
        assert_eq!(config.auto_sync_interval_secs, 300);
        assert_eq!(config.retention.max_events, 1000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_power_factor": 1.5}}"#).unwrap();
        assert!(matches!(
            SyncConfig::from_file(file.path()),
            Err(EnergyAuditError::Config(_))
        ));
    }

    #[test]
    fn test_retention_age_out_of_range_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"retention": {{"max_age_days": 200000000}}}}"#).unwrap();
        let err = SyncConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("max_age_days"));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"retention": {{"max_age_days": 90}}}}"#).unwrap();
        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retention.max_age_days, Some(90));
    }

    #[tokio::test]
    async fn test_import_calculations() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id": "P-1", "panelName": "Panel 1", "voltage": 230}}]"#).unwrap();
        let store = MemoryStore::new();
        let n = import_calculations(&store, CalculationKind::ScheduleOfLoads, file.path())
            .await
            .unwrap();
        assert_eq!(n, 1);

        let mut bad = NamedTempFile::new().unwrap();
        write!(bad, r#"[{{"panelName": "No id"}}]"#).unwrap();
        assert!(import_calculations(&store, CalculationKind::ScheduleOfLoads, bad.path())
            .await
            .is_err());
    }
}
