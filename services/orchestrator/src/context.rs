//! Shared orchestration state.
//!
//! One [`OrchestrationContext`] is owned by the orchestrator and shared with
//! the executor. It holds the active job set, the run queue, today's
//! statistics and the run generation, all behind a single mutex so that
//! check-and-insert on the active set is one critical section.
//!
//! Every run gets a new generation. Work tagged with an older generation can
//! still finish but can no longer change counters, take batches or finish the
//! run.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use fleetboot_id::{InstanceId, NodeId};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::executor::{JobStage, RebootJob};
use crate::model::{DailyRebootStats, ManagedInstance};
use crate::orchestrator::OrchestratorError;
use crate::state::Store;

/// A job in flight, as reported by [`OrchestrationContext::queue_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJob {
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub stage: JobStage,
    pub attempts: u32,
}

/// Snapshot of the queue and active jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub running: bool,
    pub aborted: Option<String>,
    pub queued: Vec<InstanceId>,
    pub active: Vec<ActiveJob>,
    pub current_batch: usize,
    pub total_batches: usize,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct ContextInner {
    active: HashMap<InstanceId, RebootJob>,
    queue: VecDeque<ManagedInstance>,
    stats: Option<DailyRebootStats>,
    generation: u64,
    running: bool,
    aborted: Option<String>,
    current_batch: usize,
    total_batches: usize,
}

impl ContextInner {
    fn live(&self, generation: u64) -> bool {
        self.running && self.generation == generation
    }
}

pub struct OrchestrationContext {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    inner: Mutex<ContextInner>,
}

impl OrchestrationContext {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            inner: Mutex::new(ContextInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().expect("orchestration context mutex poisoned")
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Insert a job unless the instance already has one. Returns false on duplicate.
    pub fn try_begin_job(&self, mut job: RebootJob) -> bool {
        let mut inner = self.lock();
        if inner.active.contains_key(&job.instance.id) {
            return false;
        }
        job.generation = inner.generation;
        inner.active.insert(job.instance.id.clone(), job);
        true
    }

    pub fn set_stage(&self, instance_id: &InstanceId, stage: JobStage) {
        self.update_job(instance_id, |job| job.stage = stage);
    }

    pub fn update_job(&self, instance_id: &InstanceId, f: impl FnOnce(&mut RebootJob)) {
        if let Some(job) = self.lock().active.get_mut(instance_id) {
            f(job);
        }
    }

    pub fn is_active(&self, instance_id: &InstanceId) -> bool {
        self.lock().active.contains_key(instance_id)
    }

    pub fn active_jobs(&self) -> Vec<RebootJob> {
        self.lock().active.values().cloned().collect()
    }

    /// Count a retry against today's record.
    pub async fn record_retry(&self, instance_id: &InstanceId) {
        let snapshot = {
            let mut inner = self.lock();
            let generation = inner.generation;
            let current = inner
                .active
                .get(instance_id)
                .is_some_and(|job| job.generation == generation);
            match inner.stats.as_mut() {
                Some(stats) if current => {
                    *stats.retries.entry(instance_id.clone()).or_insert(0) += 1;
                    Some(stats.clone())
                }
                _ => None,
            }
        };

        if let Some(stats) = snapshot {
            self.persist(&stats).await;
        }
    }

    /// Remove a finished job and count it. `result` is the attempt count or the error.
    pub async fn complete_job(&self, instance_id: &InstanceId, result: Result<u32, String>) {
        let snapshot = {
            let mut inner = self.lock();
            let Some(job) = inner.active.remove(instance_id) else {
                return;
            };
            if job.generation != inner.generation {
                info!(instance_id = %instance_id, "Job finished after reset, not counted");
                return;
            }
            let Some(stats) = inner.stats.as_mut() else {
                return;
            };
            match result {
                Ok(_) => stats.successful += 1,
                Err(_) => {
                    stats.failed += 1;
                    stats.failed_instances.push(instance_id.clone());
                }
            }
            stats.clone()
        };

        self.persist(&snapshot).await;
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Claim the run slot. Returns the new generation.
    pub fn begin_run(&self) -> Result<u64, OrchestratorError> {
        let mut inner = self.lock();
        if inner.running {
            return Err(OrchestratorError::AlreadyRunning);
        }
        inner.generation += 1;
        inner.running = true;
        inner.aborted = None;
        inner.queue.clear();
        inner.current_batch = 0;
        inner.total_batches = 0;
        Ok(inner.generation)
    }

    /// Install the run's daily record and queue.
    pub async fn start_run(
        &self,
        generation: u64,
        stats: DailyRebootStats,
        queue: Vec<ManagedInstance>,
        total_batches: usize,
    ) {
        {
            let mut inner = self.lock();
            if !inner.live(generation) {
                return;
            }
            inner.stats = Some(stats.clone());
            inner.queue = queue.into();
            inner.total_batches = total_batches;
        }
        self.persist(&stats).await;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// True while the run with `generation` is current and not aborted.
    pub fn should_continue(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.live(generation) && inner.aborted.is_none()
    }

    /// Pop up to `n` queued instances for the next batch.
    pub fn take_batch(&self, generation: u64, n: usize) -> Vec<ManagedInstance> {
        let mut inner = self.lock();
        if !inner.live(generation) || inner.aborted.is_some() || inner.queue.is_empty() {
            return Vec::new();
        }
        let n = n.min(inner.queue.len());
        inner.current_batch += 1;
        inner.queue.drain(..n).collect()
    }

    /// Abort the current run.
    ///
    /// The daily record is closed and persisted at once, and the queue and
    /// active set are emptied. In-flight jobs run to the end but are no longer
    /// tracked or counted. The run slot stays taken until the batch drains and
    /// [`finish_run`](Self::finish_run) is called. Returns the number of active
    /// jobs dropped.
    pub async fn abort(&self, reason: &str) -> Result<usize, OrchestratorError> {
        let (dropped, snapshot) = {
            let mut inner = self.lock();
            if !inner.running {
                return Err(OrchestratorError::NotRunning);
            }
            if inner.aborted.is_some() {
                return Ok(0);
            }
            inner.aborted = Some(reason.to_string());
            let queued = inner.queue.len();
            inner.queue.clear();
            let dropped = inner.active.len();
            inner.active.clear();
            warn!(reason, queued, dropped, "Reboot run aborted");

            let now = self.clock.now();
            let snapshot = inner.stats.as_mut().map(|stats| {
                stats.complete(now, Some(format!("Aborted: {reason}")));
                stats.clone()
            });
            (dropped, snapshot)
        };

        if let Some(stats) = snapshot {
            self.persist(&stats).await;
        }
        Ok(dropped)
    }

    /// Close the run with `generation`. Returns the final record, or `None`
    /// when the run is stale.
    pub async fn finish_run(
        &self,
        generation: u64,
        note: Option<String>,
    ) -> Option<DailyRebootStats> {
        let snapshot = {
            let mut inner = self.lock();
            if !inner.live(generation) {
                return None;
            }
            inner.running = false;
            inner.queue.clear();
            let mut stats = inner.stats.take()?;
            if !stats.completed {
                stats.complete(self.clock.now(), note);
            } else if let Some(note) = note {
                stats.notes.push(note);
            }
            stats
        };

        self.persist(&snapshot).await;
        Some(snapshot)
    }

    /// Drop all in-memory run state and invalidate the current generation.
    ///
    /// An unfinished record is closed with `note`. Returns the number of
    /// active jobs that were discarded.
    pub async fn emergency_reset(&self, note: &str) -> usize {
        let (cleared, snapshot) = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.running = false;
            inner.aborted = None;
            inner.queue.clear();
            inner.current_batch = 0;
            inner.total_batches = 0;
            let cleared = inner.active.len();
            inner.active.clear();

            let snapshot = inner.stats.take().filter(|s| !s.completed).map(|mut s| {
                s.complete(self.clock.now(), Some(note.to_string()));
                s
            });
            (cleared, snapshot)
        };

        if let Some(stats) = snapshot {
            self.persist(&stats).await;
        }
        cleared
    }

    pub fn queue_status(&self) -> QueueStatus {
        let inner = self.lock();
        let mut active: Vec<ActiveJob> = inner
            .active
            .values()
            .map(|job| ActiveJob {
                instance_id: job.instance.id.clone(),
                node_id: job.node_id.clone(),
                stage: job.stage,
                attempts: job.attempts,
            })
            .collect();
        active.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        QueueStatus {
            running: inner.running,
            aborted: inner.aborted.clone(),
            queued: inner.queue.iter().map(|i| i.id.clone()).collect(),
            active,
            current_batch: inner.current_batch,
            total_batches: inner.total_batches,
            generation: inner.generation,
        }
    }

    /// Live copy of the current run's record.
    pub fn current_stats(&self) -> Option<DailyRebootStats> {
        self.lock().stats.clone()
    }

    async fn persist(&self, stats: &DailyRebootStats) {
        if let Err(e) = self.store.put_daily_stats(&stats.date, stats).await {
            warn!(date = %stats.date, error = %e, "Failed to persist daily stats");
        }
    }
}
