use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How serious a disagreement between the two calculators is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
            ConflictSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Which value the two calculators disagree on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    VoltageDropMismatch,
    ConductorLengthMismatch,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::VoltageDropMismatch => "voltage-drop-mismatch",
            ConflictType::ConductorLengthMismatch => "conductor-length-mismatch",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            ConflictType::VoltageDropMismatch => "%",
            ConflictType::ConductorLengthMismatch => "m",
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side's value and the time it was authored (epoch ms)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceValue {
    pub value: f64,
    pub timestamp: i64,
}

impl SourceValue {
    pub fn new(value: f64, timestamp: i64) -> Self {
        Self { value, timestamp }
    }
}

/// How a conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "value", rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Take the Voltage Drop calculator's value
    VoltageDrop,
    /// Take the Schedule of Loads value
    ScheduleOfLoads,
    /// Use a value chosen by the user
    Manual(f64),
    /// Newest value wins
    Merge,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::VoltageDrop => write!(f, "voltage-drop"),
            ResolutionStrategy::ScheduleOfLoads => write!(f, "schedule-of-loads"),
            ResolutionStrategy::Manual(v) => write!(f, "manual({})", v),
            ResolutionStrategy::Merge => write!(f, "merge"),
        }
    }
}

/// A detected disagreement between the two calculators for one circuit.
///
/// Conflicts are never removed; resolving one only marks it resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    /// Canonical id of the voltage drop circuit in the disputed pair
    pub circuit_id: String,
    /// Canonical id of the Schedule of Loads counterpart
    pub counterpart_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub voltage_drop_source: SourceValue,
    pub schedule_of_loads_source: SourceValue,
    pub voltage_drop_compliant: Option<bool>,
    pub schedule_of_loads_compliant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Sequence numbers of the log events that document this conflict
    #[serde(default)]
    pub audit_trail: Vec<u64>,
}

impl Conflict {
    pub fn delta(&self) -> f64 {
        (self.voltage_drop_source.value - self.schedule_of_loads_source.value).abs()
    }

    pub fn key(&self) -> (&str, ConflictType) {
        (self.circuit_id.as_str(), self.conflict_type)
    }
}
