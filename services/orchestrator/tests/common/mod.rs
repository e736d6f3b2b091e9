//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use fleetboot_id::{InstanceId, NodeId};
use fleetboot_orchestrator::clock::ManualClock;
use fleetboot_orchestrator::config::EngineConfig;
use fleetboot_orchestrator::control_plane::MockControlPlane;
use fleetboot_orchestrator::executor::WarningStep;
use fleetboot_orchestrator::load::StaticLoad;
use fleetboot_orchestrator::model::{date_key, InstanceState, ManagedInstance, WorkerNode};
use fleetboot_orchestrator::notify::RecordingNotifier;
use fleetboot_orchestrator::orchestrator::{Orchestrator, OrchestratorParts};
use fleetboot_orchestrator::state::MemoryStore;
use fleetboot_plan::BatchStrategy;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap()
}

pub fn id(s: &str) -> InstanceId {
    InstanceId::parse(s).unwrap()
}

pub fn instance(s: &str, tag: &str) -> ManagedInstance {
    ManagedInstance {
        id: id(s),
        tag: tag.to_string(),
        name: format!("Server {s}"),
        excluded: false,
        early_access: false,
    }
}

pub fn node(s: &str, capacity: u32) -> WorkerNode {
    WorkerNode {
        id: NodeId::parse(s).unwrap(),
        name: s.to_string(),
        capacity,
        metrics: None,
    }
}

/// `count` plain instances named `srv-1..=count`.
pub fn fleet(count: usize) -> Vec<ManagedInstance> {
    (1..=count)
        .map(|n| instance(&format!("srv-{n}"), "survival"))
        .collect()
}

/// Defaults with a single short warning and a short cooldown.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.executor.warning_steps = vec![WarningStep::new("Server restarting now", Duration::from_secs(1))];
    config.orchestrator.batch_cooldown = Duration::from_secs(30);
    config
}

pub fn fixed_batches(config: &mut EngineConfig, size: usize) {
    config.orchestrator.batch.strategy = BatchStrategy::Fixed;
    config.orchestrator.batch.max_batch_size = size;
}

pub struct Harness {
    pub control_plane: MockControlPlane,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub load: Arc<StaticLoad>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    /// Every instance starts running with an hour of uptime on two nodes of
    /// capacity two.
    pub fn new(instances: Vec<ManagedInstance>, config: EngineConfig) -> Self {
        let control_plane = MockControlPlane::new();
        for i in &instances {
            control_plane.add_instance(&i.id, InstanceState::Running, Some(Duration::from_secs(3600)));
        }
        control_plane.set_nodes(Some(vec![node("node-a", 2), node("node-b", 2)]));

        let store = Arc::new(MemoryStore::with_instances(instances));
        let notifier = Arc::new(RecordingNotifier::new());
        let load = Arc::new(StaticLoad::new(0));
        let clock = Arc::new(ManualClock::new(start_time()));

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorParts {
                control_plane: Arc::new(control_plane.clone()),
                telemetry_source: Arc::new(control_plane.clone()),
                store: store.clone(),
                notifier: notifier.clone(),
                load: load.clone(),
                clock: clock.clone(),
            },
            config,
        ));

        Self {
            control_plane,
            store,
            notifier,
            load,
            clock,
            orchestrator,
        }
    }

    pub fn today(&self) -> String {
        date_key(start_time())
    }

    /// Let spawned tasks settle. Time is paused, so this only advances the
    /// clock once everything else is idle.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
