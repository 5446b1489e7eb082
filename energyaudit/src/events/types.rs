use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::circuit::CircuitSource;
use crate::conflict::{ConflictSeverity, ResolutionStrategy};

/// Who caused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    VoltageDrop,
    ScheduleOfLoads,
    System,
    User,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::VoltageDrop => "voltage-drop",
            EventSource::ScheduleOfLoads => "schedule-of-loads",
            EventSource::System => "system",
            EventSource::User => "user",
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CircuitSource> for EventSource {
    fn from(source: CircuitSource) -> Self {
        match source {
            CircuitSource::VoltageDrop => EventSource::VoltageDrop,
            CircuitSource::ScheduleOfLoads => EventSource::ScheduleOfLoads,
        }
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voltage-drop" => Ok(EventSource::VoltageDrop),
            "schedule-of-loads" => Ok(EventSource::ScheduleOfLoads),
            "system" => Ok(EventSource::System),
            "user" => Ok(EventSource::User),
            other => Err(format!("unknown event source: {}", other)),
        }
    }
}

/// Why a canonical circuit changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateReason {
    /// A calculator edited the native record
    Edit,
    /// A sync pass re-derived the circuit from saved data
    Sync,
    Recalculation,
    Resolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCompletion {
    pub successful: bool,
    pub duration_ms: u64,
    pub circuits_processed: usize,
    pub conflicts_detected: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event payload, serialized as `{"type": ..., "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SyncEventKind {
    SyncRequested {
        manual: bool,
    },
    SyncCompleted(SyncCompletion),
    #[serde(rename_all = "camelCase")]
    CircuitUpdated {
        circuit_id: String,
        reason: UpdateReason,
    },
    #[serde(rename_all = "camelCase")]
    CircuitCreated {
        circuit_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CircuitDeleted {
        circuit_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LoadScheduleUpdated {
        schedule_id: String,
        load_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    LoadItemUpdated {
        schedule_id: Option<String>,
        load_id: String,
        circuit_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConflictDetected {
        conflict_id: String,
        circuit_id: String,
        severity: ConflictSeverity,
    },
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        conflict_id: String,
        circuit_id: String,
        strategy: ResolutionStrategy,
    },
}

impl SyncEventKind {
    pub fn event_type(&self) -> SyncEventType {
        match self {
            SyncEventKind::SyncRequested { .. } => SyncEventType::SyncRequested,
            SyncEventKind::SyncCompleted(_) => SyncEventType::SyncCompleted,
            SyncEventKind::CircuitUpdated { .. } => SyncEventType::CircuitUpdated,
            SyncEventKind::CircuitCreated { .. } => SyncEventType::CircuitCreated,
            SyncEventKind::CircuitDeleted { .. } => SyncEventType::CircuitDeleted,
            SyncEventKind::LoadScheduleUpdated { .. } => SyncEventType::LoadScheduleUpdated,
            SyncEventKind::LoadItemUpdated { .. } => SyncEventType::LoadItemUpdated,
            SyncEventKind::ConflictDetected { .. } => SyncEventType::ConflictDetected,
            SyncEventKind::ConflictResolved { .. } => SyncEventType::ConflictResolved,
        }
    }
}

/// Payload discriminant, used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncEventType {
    SyncRequested,
    SyncCompleted,
    CircuitUpdated,
    CircuitCreated,
    CircuitDeleted,
    LoadScheduleUpdated,
    LoadItemUpdated,
    ConflictDetected,
    ConflictResolved,
}

impl SyncEventType {
    pub const ALL: [SyncEventType; 9] = [
        SyncEventType::SyncRequested,
        SyncEventType::SyncCompleted,
        SyncEventType::CircuitUpdated,
        SyncEventType::CircuitCreated,
        SyncEventType::CircuitDeleted,
        SyncEventType::LoadScheduleUpdated,
        SyncEventType::LoadItemUpdated,
        SyncEventType::ConflictDetected,
        SyncEventType::ConflictResolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventType::SyncRequested => "sync-requested",
            SyncEventType::SyncCompleted => "sync-completed",
            SyncEventType::CircuitUpdated => "circuit-updated",
            SyncEventType::CircuitCreated => "circuit-created",
            SyncEventType::CircuitDeleted => "circuit-deleted",
            SyncEventType::LoadScheduleUpdated => "load-schedule-updated",
            SyncEventType::LoadItemUpdated => "load-item-updated",
            SyncEventType::ConflictDetected => "conflict-detected",
            SyncEventType::ConflictResolved => "conflict-resolved",
        }
    }
}

impl std::fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// An immutable log entry. `seq` orders events; `timestamp` is for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    #[serde(flatten)]
    pub kind: SyncEventKind,
}

impl SyncEvent {
    pub fn event_type(&self) -> SyncEventType {
        self.kind.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_tagged() {
        let event = SyncEvent {
            seq: 7,
            timestamp: Utc::now(),
            source: EventSource::ScheduleOfLoads,
            kind: SyncEventKind::LoadItemUpdated {
                schedule_id: Some("P-1".to_string()),
                load_id: "L1".to_string(),
                circuit_id: "P-1-L1".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "load-item-updated");
        assert_eq!(json["source"], "schedule-of-loads");
        assert_eq!(json["data"]["circuitId"], "P-1-L1");
        assert_eq!(json["seq"], 7);
    }

    #[test]
    fn test_event_type_parsing() {
        assert_eq!("sync-completed".parse::<SyncEventType>(), Ok(SyncEventType::SyncCompleted));
        assert!("sync-finished".parse::<SyncEventType>().is_err());
        assert_eq!("user".parse::<EventSource>(), Ok(EventSource::User));
    }
}
