use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{CalculationKind, CalculationStore, Result, SavedCalculation, StoreError};

/// SQLite-backed calculation store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS saved_calculations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                UNIQUE(kind, name)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_saved_calculations_kind
             ON saved_calculations(kind)",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn save_blocking(conn: &Connection, kind: CalculationKind, name: &str, data: &serde_json::Value) -> Result<String> {
        let now = Utc::now().to_rfc3339();
        let json = serde_json::to_string(data)?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM saved_calculations WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), name],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE saved_calculations SET data = ?2, saved_at = ?3 WHERE id = ?1",
                params![id, json, now],
            )?;
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO saved_calculations (id, kind, name, data, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, kind.as_str(), name, json, now],
        )?;
        Ok(id)
    }

    fn load_blocking(conn: &Connection, kind: CalculationKind) -> Result<Vec<SavedCalculation>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, data, saved_at FROM saved_calculations
             WHERE kind = ?1 ORDER BY saved_at ASC, name ASC",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut saved = Vec::new();
        for row in rows {
            let (id, name, data, saved_at) = row?;
            let saved_at = DateTime::parse_from_rfc3339(&saved_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            saved.push(SavedCalculation {
                id,
                name,
                data: serde_json::from_str(&data)?,
                saved_at,
            });
        }
        Ok(saved)
    }
}

#[async_trait]
impl CalculationStore for SqliteStore {
    async fn save_calculation(
        &self,
        kind: CalculationKind,
        name: &str,
        data: serde_json::Value,
    ) -> Result<String> {
        let conn = self.conn.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| StoreError::Lock(e.to_string()))?;
            Self::save_blocking(&conn, kind, &name, &data)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn load_saved_calculations(&self, kind: CalculationKind) -> Result<Vec<SavedCalculation>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| StoreError::Lock(e.to_string()))?;
            Self::load_blocking(&conn, kind)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("audit.db")).unwrap();

        let id = store
            .save_calculation(CalculationKind::VoltageDrop, "run-1", json!({"current": 12.5}))
            .await
            .unwrap();
        let again = store
            .save_calculation(CalculationKind::VoltageDrop, "run-1", json!({"current": 15.0}))
            .await
            .unwrap();
        assert_eq!(id, again);

        let saved = store
            .load_saved_calculations(CalculationKind::VoltageDrop)
            .await
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].data["current"], 15.0);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .save_calculation(CalculationKind::ScheduleOfLoads, "P-1", json!({"id": "P-1"}))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let saved = store
            .load_saved_calculations(CalculationKind::ScheduleOfLoads)
            .await
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name, "P-1");
    }
}
