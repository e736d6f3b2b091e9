//! Domain records shared by the orchestrator, detector and store.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetboot_id::{InstanceId, NodeId, RunId};
use serde::{Deserialize, Serialize};

/// Observed power state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// No observation yet.
    #[default]
    Unknown,
    Offline,
    Starting,
    Running,
    Stopping,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Offline => "offline",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    /// Parse a control plane state string. Unrecognised values map to `Unknown`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "offline" | "stopped" => Self::Offline,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource usage reported for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    pub disk_bytes: u64,
}

/// Point-in-time status of an instance, from a status query or telemetry push.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub uptime: Option<Duration>,
    pub resource_usage: ResourceUsage,
}

/// Optional resource metrics for a worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub cpu_percent: f64,
}

/// A host with finite capacity for concurrent reboot operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: NodeId,
    pub name: String,

    /// Maximum concurrent reboot operations.
    pub capacity: u32,

    #[serde(default)]
    pub metrics: Option<NodeMetrics>,
}

/// One game-server instance under fleet management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedInstance {
    pub id: InstanceId,
    pub tag: String,
    pub name: String,

    /// Skip this instance in fleet-wide operations.
    #[serde(default)]
    pub excluded: bool,

    #[serde(default)]
    pub early_access: bool,
}

/// A recorded state change for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub instance_id: InstanceId,
    pub from_state: InstanceState,
    pub to_state: InstanceState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

/// Classification of a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashKind {
    UnexpectedStop,
    CrashLoop,
    FailedStart,
}

impl CrashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnexpectedStop => "unexpected_stop",
            Self::CrashLoop => "crash_loop",
            Self::FailedStart => "failed_start",
        }
    }
}

impl std::fmt::Display for CrashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A crash derived from state transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashEvent {
    pub kind: CrashKind,
    pub instance_id: InstanceId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Per-day reboot bookkeeping, keyed by `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DailyRebootStats {
    pub date: String,
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub triggered: bool,
    #[serde(default)]
    pub trigger_reason: Option<String>,

    /// Aggregate load (connected players) when the run was triggered.
    #[serde(default)]
    pub trigger_load: Option<u64>,

    pub total: u32,
    pub successful: u32,
    pub failed: u32,

    /// Retries per instance.
    #[serde(default)]
    pub retries: BTreeMap<InstanceId, u32>,

    #[serde(default)]
    pub failed_instances: Vec<InstanceId>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub completed: bool,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl DailyRebootStats {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            ..Self::default()
        }
    }

    /// True when a run was started for this day but never finished.
    pub fn is_interrupted(&self) -> bool {
        self.triggered && !self.completed
    }

    /// Mark the run completed with an optional note.
    pub fn complete(&mut self, at: DateTime<Utc>, note: Option<String>) {
        self.completed = true;
        self.ended_at = Some(at);
        if let Some(note) = note {
            self.notes.push(note);
        }
    }
}

/// Calendar-day key used for daily stats.
pub fn date_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_instance_state_from_wire() {
        assert_eq!(InstanceState::from_wire("running"), InstanceState::Running);
        assert_eq!(InstanceState::from_wire("stopped"), InstanceState::Offline);
        assert_eq!(InstanceState::from_wire("installing"), InstanceState::Unknown);
    }

    #[test]
    fn test_daily_stats_serialization() {
        let mut stats = DailyRebootStats::new("2026-10-16");
        stats.triggered = true;
        stats
            .retries
            .insert(InstanceId::parse("lobby-01").unwrap(), 2);

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"retries\":{\"lobby-01\":2}"));

        let parsed: DailyRebootStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stats);
        assert!(parsed.is_interrupted());
    }

    #[test]
    fn test_complete_appends_note() {
        let mut stats = DailyRebootStats::new("2026-10-16");
        stats.triggered = true;
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 5, 0, 0).unwrap();
        stats.complete(at, Some("done".to_string()));
        assert!(stats.completed);
        assert_eq!(stats.ended_at, Some(at));
        assert_eq!(stats.notes, vec!["done".to_string()]);
        assert!(!stats.is_interrupted());
    }

    #[test]
    fn test_date_key() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 23, 59, 59).unwrap();
        assert_eq!(date_key(at), "2026-01-02");
    }
}
