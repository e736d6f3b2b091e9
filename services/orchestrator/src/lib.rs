//! fleetboot Reboot Orchestrator Library
//!
//! Reboots a game-server fleet during quiet hours without taking too much of
//! it down at once, and watches every instance for crashes in between.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//! ├── NodeDiscovery      (worker nodes and their capacity)
//! ├── RebootExecutor     (warn, stop, start one instance with retries)
//! ├── CrashDetector      (state-transition classification)
//! └── TelemetryMonitor   (ref-counted live status subscriptions)
//! ```
//!
//! All run state lives in an [`OrchestrationContext`] shared by the
//! orchestrator and executor. The daily record is persisted through a
//! [`Store`] so an interrupted run is detected on restart.
//!
//! ## Modules
//!
//! - `control_plane`: Remote control plane client and in-process mock
//! - `telemetry`: Per-instance status subscriptions
//! - `health`: Crash detection
//! - `executor`: Single-instance reboot jobs
//! - `orchestrator`: Triggering, batching and recovery
//! - `state`: SQLite and in-memory persistence

pub mod backoff;
pub mod clock;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod discovery;
pub mod executor;
pub mod health;
pub mod load;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, EngineConfig};
pub use context::{OrchestrationContext, QueueStatus};
pub use control_plane::{ControlPlane, HttpControlPlane, MockControlPlane};
pub use executor::{ExecutorConfig, JobOutcome, RebootExecutor};
pub use health::{CrashDetector, DetectorConfig};
pub use model::{DailyRebootStats, InstanceState, ManagedInstance, WorkerNode};
pub use notify::{Audience, Notifier};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorParts, RecoveryOutcome,
    RunSummary, TriggerDecision,
};
pub use state::{MemoryStore, SqliteStore, Store};
pub use telemetry::{TelemetryMonitor, TelemetrySource};
