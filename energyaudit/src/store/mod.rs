//! Saved Calculation Storage
//!
//! A generic key-value store for calculations saved by the calculators. The
//! engine reads Schedule of Loads and Voltage Drop records from it during a
//! sync pass and writes converged records back after conflict resolution.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("Storage task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Which calculator a saved calculation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalculationKind {
    ScheduleOfLoads,
    VoltageDrop,
}

impl CalculationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationKind::ScheduleOfLoads => "schedule-of-loads",
            CalculationKind::VoltageDrop => "voltage-drop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedCalculation {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

/// Persistence consumed by the engine
#[async_trait]
pub trait CalculationStore: Send + Sync {
    /// Save `data` under `name`, replacing an earlier save with the same
    /// kind and name. Returns the calculation id.
    async fn save_calculation(
        &self,
        kind: CalculationKind,
        name: &str,
        data: serde_json::Value,
    ) -> Result<String>;

    async fn load_saved_calculations(&self, kind: CalculationKind) -> Result<Vec<SavedCalculation>>;
}

/// In-memory store, used for tests and CLI runs backed by JSON files
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<CalculationKind, Vec<SavedCalculation>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CalculationStore for MemoryStore {
    async fn save_calculation(
        &self,
        kind: CalculationKind,
        name: &str,
        data: serde_json::Value,
    ) -> Result<String> {
        let mut entries = self.entries.write().await;
        let list = entries.entry(kind).or_default();
        let now = Utc::now();

        if let Some(existing) = list.iter_mut().find(|c| c.name == name) {
            existing.data = data;
            existing.saved_at = now;
            return Ok(existing.id.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        list.push(SavedCalculation {
            id: id.clone(),
            name: name.to_string(),
            data,
            saved_at: now,
        });
        Ok(id)
    }

    async fn load_saved_calculations(&self, kind: CalculationKind) -> Result<Vec<SavedCalculation>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }
}
