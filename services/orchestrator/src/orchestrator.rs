//! Reboot orchestrator.
//!
//! Decides when to reboot the fleet, builds the queue of eligible instances
//! and walks it batch by batch. Batches are strictly sequential; inside a
//! batch every node-group runs concurrently and a group larger than its
//! node's capacity is split into sequential sub-batches.
//!
//! # Trigger
//!
//! Every `check_interval` the aggregate load is read from the [`LoadProbe`].
//! A run starts when the load is under `player_threshold`, no run is in
//! progress and today's record is not already completed or interrupted.
//!
//! # Recovery
//!
//! [`Orchestrator::recover`] runs at process start. A run that was triggered
//! but never completed is closed with a note. It is not resumed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetboot_id::{InstanceId, NodeId, RunId};
use fleetboot_plan::{group_by_node, map_instances_to_nodes, plan_batches, sub_batches, BatchConfig};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::context::{OrchestrationContext, QueueStatus};
use crate::control_plane::ControlPlane;
use crate::discovery::NodeDiscovery;
use crate::executor::{JobOutcome, RebootExecutor};
use crate::health::CrashDetector;
use crate::load::LoadProbe;
use crate::model::{date_key, DailyRebootStats, ManagedInstance, WorkerNode};
use crate::notify::{Audience, Notifier};
use crate::state::{Store, StoreError};
use crate::telemetry::{TelemetryMonitor, TelemetrySource};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a reboot run is already in progress")]
    AlreadyRunning,

    #[error("no reboot run in progress")]
    NotRunning,

    #[error("run was superseded by an emergency cleanup")]
    Superseded,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub check_interval: Duration,

    /// Runs trigger when the aggregate load is below this.
    pub player_threshold: u64,

    pub batch: BatchConfig,
    pub batch_cooldown: Duration,

    /// Instances with one of these tags are skipped (case-insensitive).
    pub excluded_tags: Vec<String>,

    /// Skip instances whose known uptime is below this.
    pub min_uptime: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            player_threshold: 10,
            batch: BatchConfig::default(),
            batch_cooldown: Duration::from_secs(60),
            excluded_tags: Vec::new(),
            min_uptime: None,
        }
    }
}

/// Result of a trigger evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Trigger { load: u64 },
    AboveThreshold { load: u64 },
    AlreadyRunning,
    AlreadyCompleted,
    /// Today's run was started but never finished.
    Interrupted,
    LoadUnavailable,
    StoreUnavailable,
}

impl TriggerDecision {
    pub fn should_trigger(&self) -> bool {
        matches!(self, Self::Trigger { .. })
    }
}

/// Totals for a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub date: String,
    pub total: u32,
    pub successful: u32,
    pub failed: u32,
    pub failed_instances: Vec<InstanceId>,
    pub batches: usize,
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Nothing to recover.
    Clean,
    /// An interrupted run for `date` was closed.
    Recovered { date: String, successful: u32, total: u32 },
    StoreUnavailable,
}

/// External collaborators the orchestrator is built from.
pub struct OrchestratorParts {
    pub control_plane: Arc<dyn ControlPlane>,
    pub telemetry_source: Arc<dyn TelemetrySource>,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
    pub load: Arc<dyn LoadProbe>,
    pub clock: Arc<dyn Clock>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    load: Arc<dyn LoadProbe>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<TelemetryMonitor>,
    detector: Arc<CrashDetector>,
    discovery: NodeDiscovery,
    executor: RebootExecutor,
    context: Arc<OrchestrationContext>,
    watchers: Mutex<HashMap<InstanceId, JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts, config: EngineConfig) -> Self {
        let OrchestratorParts {
            control_plane,
            telemetry_source,
            store,
            notifier,
            load,
            clock,
        } = parts;

        let telemetry = Arc::new(TelemetryMonitor::new(telemetry_source, config.telemetry));
        let detector = Arc::new(CrashDetector::new(
            config.detector,
            Arc::clone(&clock),
            Arc::clone(&store),
            Arc::clone(&notifier),
        ));
        let context = Arc::new(OrchestrationContext::new(
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        let default_capacity =
            u32::try_from(config.orchestrator.batch.max_concurrent_per_node).unwrap_or(u32::MAX);
        let discovery = NodeDiscovery::new(
            Arc::clone(&control_plane),
            config.fallback_nodes,
            default_capacity,
        );
        let executor = RebootExecutor::new(
            control_plane,
            Arc::clone(&telemetry),
            Arc::clone(&detector),
            Arc::clone(&context),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.executor,
        );

        Self {
            config: config.orchestrator,
            store,
            notifier,
            load,
            clock,
            telemetry,
            detector,
            discovery,
            executor,
            context,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<OrchestrationContext> {
        &self.context
    }

    pub fn detector(&self) -> &Arc<CrashDetector> {
        &self.detector
    }

    pub fn telemetry(&self) -> &Arc<TelemetryMonitor> {
        &self.telemetry
    }

    pub fn executor(&self) -> &RebootExecutor {
        &self.executor
    }

    // =========================================================================
    // Trigger
    // =========================================================================

    /// Decide whether a run should start now.
    pub async fn evaluate_trigger(&self) -> TriggerDecision {
        if self.context.is_running() {
            return TriggerDecision::AlreadyRunning;
        }

        let date = date_key(self.clock.now());
        match self.store.get_daily_stats(&date).await {
            Ok(Some(stats)) if stats.completed => return TriggerDecision::AlreadyCompleted,
            Ok(Some(stats)) if stats.triggered => return TriggerDecision::Interrupted,
            Ok(_) => {}
            Err(e) => {
                warn!(date = %date, error = %e, "Failed to read daily stats");
                return TriggerDecision::StoreUnavailable;
            }
        }

        match self.load.current_load().await {
            Ok(load) if load < self.config.player_threshold => TriggerDecision::Trigger { load },
            Ok(load) => TriggerDecision::AboveThreshold { load },
            Err(e) => {
                warn!(error = %e, "Failed to read fleet load");
                TriggerDecision::LoadUnavailable
            }
        }
    }

    /// Evaluate the trigger and run inline when it fires.
    pub async fn tick(&self) -> Option<RunSummary> {
        match self.evaluate_trigger().await {
            TriggerDecision::Trigger { load } => {
                let reason = self.trigger_reason(load);
                match self.execute_run(&reason, Some(load)).await {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        warn!(error = %e, "Scheduled reboot run did not complete");
                        None
                    }
                }
            }
            decision => {
                debug!(?decision, "No reboot triggered");
                None
            }
        }
    }

    fn trigger_reason(&self, load: u64) -> String {
        format!(
            "Low player count ({load} < {})",
            self.config.player_threshold
        )
    }

    /// Periodic trigger loop. Runs are spawned so the loop stays responsive.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            player_threshold = self.config.player_threshold,
            "Orchestrator loop started"
        );

        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.detector.prune();
                    match self.evaluate_trigger().await {
                        TriggerDecision::Trigger { load } => {
                            let this = Arc::clone(&self);
                            let reason = self.trigger_reason(load);
                            tokio::spawn(async move {
                                if let Err(e) = this.execute_run(&reason, Some(load)).await {
                                    warn!(error = %e, "Scheduled reboot run did not complete");
                                }
                            });
                        }
                        decision => debug!(?decision, "No reboot triggered"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Orchestrator loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Start a run now, regardless of load or today's record.
    pub async fn force_trigger(&self, reason: &str) -> Result<RunSummary, OrchestratorError> {
        info!(reason, "Forced reboot run requested");
        self.execute_run(reason, None).await
    }

    // =========================================================================
    // Run
    // =========================================================================

    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    pub async fn execute_run(
        &self,
        reason: &str,
        load: Option<u64>,
    ) -> Result<RunSummary, OrchestratorError> {
        let generation = self.context.begin_run()?;
        let now = self.clock.now();
        let date = date_key(now);
        let run_id = RunId::new();
        tracing::Span::current().record("run_id", tracing::field::display(&run_id));

        let instances = match self.store.get_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "Failed to load instances, abandoning run");
                self.context.finish_run(generation, None).await;
                return Err(e.into());
            }
        };

        let queue = self.eligible_instances(instances).await;
        let nodes = self.discovery.discover_nodes().await;
        let plan = plan_batches(nodes.len(), queue.len(), &self.config.batch);

        // Forced reruns start counters from zero but keep earlier notes.
        let notes = match self.store.get_daily_stats(&date).await {
            Ok(Some(previous)) => previous.notes,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read previous daily stats");
                Vec::new()
            }
        };

        let total = u32::try_from(queue.len()).unwrap_or(u32::MAX);
        let mut stats = DailyRebootStats::new(&date);
        stats.run_id = Some(run_id);
        stats.triggered = true;
        stats.trigger_reason = Some(reason.to_string());
        stats.trigger_load = load;
        stats.total = total;
        stats.started_at = Some(now);
        stats.notes = notes;

        self.context
            .start_run(generation, stats, queue, plan.total_batches)
            .await;

        info!(
            total,
            nodes = nodes.len(),
            batch_size = plan.batch_size,
            total_batches = plan.total_batches,
            reason,
            "Reboot run started"
        );
        self.notifier
            .notify(
                Audience::Staff,
                &format!(
                    "Reboot run started ({reason}): {total} instances in {} batches of up to {}",
                    plan.total_batches, plan.batch_size
                ),
            )
            .await;
        if total > 0 {
            self.notifier
                .notify(
                    Audience::Public,
                    "Scheduled server restarts are starting. Each server will warn before it restarts.",
                )
                .await;
        }

        let mut batches = 0;
        while self.context.should_continue(generation) {
            let batch = self.context.take_batch(generation, plan.batch_size);
            if batch.is_empty() {
                break;
            }
            batches += 1;
            info!(batch = batches, total_batches = plan.total_batches, size = batch.len(), "Starting batch");
            self.run_batch(&batch, &nodes).await;
            info!(batch = batches, "Batch finished");

            let more = !self.context.queue_status().queued.is_empty();
            if more && self.context.should_continue(generation) {
                tokio::time::sleep(self.config.batch_cooldown).await;
            }
        }

        let aborted = self.context.queue_status().aborted.is_some();
        let Some(final_stats) = self.context.finish_run(generation, None).await else {
            warn!("Reboot run superseded, not finalizing");
            return Err(OrchestratorError::Superseded);
        };

        let summary = RunSummary {
            run_id,
            date,
            total: final_stats.total,
            successful: final_stats.successful,
            failed: final_stats.failed,
            failed_instances: final_stats.failed_instances.clone(),
            batches,
            aborted,
        };
        info!(
            successful = summary.successful,
            failed = summary.failed,
            batches,
            aborted,
            "Reboot run finished"
        );
        self.notify_completion(&summary).await;
        Ok(summary)
    }

    async fn notify_completion(&self, summary: &RunSummary) {
        let mut message = format!(
            "Reboot run {}: {}/{} instances restarted, {} failed",
            if summary.aborted { "aborted" } else { "complete" },
            summary.successful,
            summary.total,
            summary.failed
        );
        if !summary.failed_instances.is_empty() {
            let failed: Vec<&str> = summary.failed_instances.iter().map(|i| i.as_str()).collect();
            message.push_str(&format!(" ({})", failed.join(", ")));
        }
        self.notifier.notify(Audience::Staff, &message).await;

        if summary.total > 0 {
            self.notifier
                .notify(Audience::Public, "Scheduled server restarts are complete.")
                .await;
        }
    }

    async fn run_batch(&self, batch: &[ManagedInstance], nodes: &[WorkerNode]) {
        let ids: Vec<InstanceId> = batch.iter().map(|i| i.id.clone()).collect();
        let node_ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        let assignment = map_instances_to_nodes(&ids, &node_ids);

        let by_id: HashMap<&InstanceId, &ManagedInstance> = batch.iter().map(|i| (&i.id, i)).collect();
        let capacity: HashMap<&NodeId, usize> = nodes
            .iter()
            .map(|n| (&n.id, n.capacity as usize))
            .collect();

        let groups = group_by_node(&ids, &assignment).into_iter().map(|(node_id, members)| {
            let instances: Vec<ManagedInstance> = members
                .iter()
                .filter_map(|id| by_id.get(id).map(|i| (*i).clone()))
                .collect();
            let cap = capacity.get(&node_id).copied().unwrap_or(1);
            self.run_node_group(node_id, instances, cap)
        });

        join_all(groups).await;
    }

    async fn run_node_group(&self, node_id: NodeId, instances: Vec<ManagedInstance>, capacity: usize) {
        let chunks = sub_batches(&instances, capacity);
        if chunks.len() > 1 {
            debug!(node_id = %node_id, size = instances.len(), capacity, sub_batches = chunks.len(), "Node group exceeds capacity, splitting");
        }

        for chunk in chunks {
            let jobs = chunk.iter().map(|instance| self.executor.run(instance, &node_id));
            for outcome in join_all(jobs).await {
                if outcome == JobOutcome::Duplicate {
                    debug!(node_id = %node_id, "Skipped duplicate job");
                }
            }
        }
    }

    // =========================================================================
    // Eligibility
    // =========================================================================

    async fn eligible_instances(&self, instances: Vec<ManagedInstance>) -> Vec<ManagedInstance> {
        let candidates = filter_eligible(instances, &self.config.excluded_tags);
        let Some(min_uptime) = self.config.min_uptime else {
            return candidates;
        };

        let uptimes = join_all(candidates.iter().map(|i| self.telemetry.uptime(&i.id))).await;
        candidates
            .into_iter()
            .zip(uptimes)
            .filter_map(|(instance, uptime)| match uptime {
                Some(uptime) if uptime < min_uptime => {
                    debug!(instance_id = %instance.id, uptime_secs = uptime.as_secs(), "Uptime below minimum, skipping");
                    None
                }
                _ => Some(instance),
            })
            .collect()
    }

    // =========================================================================
    // Controls
    // =========================================================================

    /// Close today's record and stop launching batches.
    ///
    /// In-flight jobs run to completion but are no longer counted.
    pub async fn abort(&self, reason: &str) -> Result<(), OrchestratorError> {
        let dropped = self.context.abort(reason).await?;
        info!(dropped, "In-flight reboots left to finish untracked");
        self.notifier
            .notify(Audience::Staff, &format!("Reboot run aborted: {reason}"))
            .await;
        Ok(())
    }

    /// Drop all in-memory run state and telemetry subscriptions.
    ///
    /// Returns the number of active jobs discarded.
    pub async fn emergency_cleanup(&self) -> usize {
        let cleared = self.context.emergency_reset("Emergency cleanup").await;
        self.telemetry.stop_all();

        let rewatch = {
            let mut watchers = self.watchers.lock().expect("watchers mutex poisoned");
            let had = !watchers.is_empty();
            for (_, task) in watchers.drain() {
                task.abort();
            }
            had
        };
        if rewatch {
            if let Err(e) = self.watch_fleet().await {
                warn!(error = %e, "Failed to resume fleet health watch");
            }
        }

        warn!(cleared, "Emergency cleanup performed");
        self.notifier
            .notify(
                Audience::Staff,
                &format!("Emergency cleanup: cleared {cleared} active reboot jobs"),
            )
            .await;
        cleared
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.context.queue_status()
    }

    /// Daily record for `date`: the live copy during a run, otherwise the stored one.
    pub async fn stats_for(&self, date: &str) -> Result<Option<DailyRebootStats>, OrchestratorError> {
        if let Some(live) = self.context.current_stats().filter(|s| s.date == date) {
            return Ok(Some(live));
        }
        Ok(self.store.get_daily_stats(date).await?)
    }

    /// One-line status for display, e.g. `running (recently crashed)`.
    pub fn instance_status(&self, instance_id: &InstanceId) -> String {
        let health = self.detector.status(instance_id);
        let job = self
            .context
            .active_jobs()
            .into_iter()
            .find(|j| &j.instance.id == instance_id);

        let mut line = health.current_state.to_string();
        if let Some(job) = job {
            line.push_str(&format!(" [rebooting: {}", job.stage));
            if job.attempts > 0 {
                line.push_str(&format!(", retry {}", job.attempts));
            }
            line.push(']');
        }
        if !health.status_text.is_empty() {
            line.push(' ');
            line.push_str(health.status_text);
        }
        line
    }

    /// Follow every managed instance with the crash detector. Instances already
    /// followed are skipped. Returns the number of new watchers.
    pub async fn watch_fleet(&self) -> Result<usize, OrchestratorError> {
        let instances = self.store.get_instances().await?;
        let mut watchers = self.watchers.lock().expect("watchers mutex poisoned");

        let mut started = 0;
        for instance in instances {
            if watchers.get(&instance.id).is_some_and(|t| !t.is_finished()) {
                continue;
            }
            let handle = self.telemetry.start(&instance.id);
            watchers.insert(instance.id.clone(), self.detector.follow(handle));
            started += 1;
        }

        info!(started, watched = watchers.len(), "Fleet health watch active");
        Ok(started)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Close a run interrupted by a process restart.
    pub async fn recover(&self) -> RecoveryOutcome {
        let now = self.clock.now();
        let date = date_key(now);

        let mut stats = match self.store.get_daily_stats(&date).await {
            Ok(Some(stats)) if stats.is_interrupted() => stats,
            Ok(_) => {
                debug!(date = %date, "No interrupted run to recover");
                return RecoveryOutcome::Clean;
            }
            Err(e) => {
                warn!(date = %date, error = %e, "Failed to read daily stats during recovery");
                return RecoveryOutcome::StoreUnavailable;
            }
        };

        self.context.emergency_reset("Interrupted by restart").await;
        stats.complete(
            now,
            Some("Interrupted by orchestrator restart; not resumed".to_string()),
        );
        if let Err(e) = self.store.put_daily_stats(&date, &stats).await {
            warn!(date = %date, error = %e, "Failed to persist recovered daily stats");
        }

        warn!(
            date = %date,
            successful = stats.successful,
            total = stats.total,
            "Recovered interrupted reboot run"
        );
        self.notifier
            .notify(
                Audience::Staff,
                &format!(
                    "Reboot run for {date} was interrupted by a restart ({}/{} done) and will not resume",
                    stats.successful, stats.total
                ),
            )
            .await;

        RecoveryOutcome::Recovered {
            date,
            successful: stats.successful,
            total: stats.total,
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Ok(watchers) = self.watchers.get_mut() {
            for (_, task) in watchers.drain() {
                task.abort();
            }
        }
    }
}

/// Static eligibility: not excluded, not early access, tag not excluded.
pub fn filter_eligible(
    instances: Vec<ManagedInstance>,
    excluded_tags: &[String],
) -> Vec<ManagedInstance> {
    instances
        .into_iter()
        .filter(|i| {
            !i.excluded
                && !i.early_access
                && !excluded_tags.iter().any(|t| t.eq_ignore_ascii_case(&i.tag))
        })
        .collect()
}
