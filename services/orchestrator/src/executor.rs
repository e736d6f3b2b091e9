//! Single-instance reboot state machine.
//!
//! A job walks `Warning -> Stopping -> Starting -> Completed`. A failed stop or
//! start stage is retried from `Stopping` with linear backoff until the retry
//! limit or the job time ceiling is reached, at which point the job is
//! `Failed` and staff are alerted once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetboot_id::{InstanceId, NodeId};
use fleetboot_plan::{RetryBudget, RetryDecision};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::context::OrchestrationContext;
use crate::control_plane::{ControlPlane, ControlPlaneError, PowerAction};
use crate::health::CrashDetector;
use crate::model::{InstanceState, ManagedInstance};
use crate::notify::{Audience, Notifier};
use crate::telemetry::{TelemetryHandle, TelemetryMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    Warning,
    Stopping,
    Starting,
    Completed,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Stopping => "stopping",
            Self::Starting => "starting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-flight reboot of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootJob {
    pub instance: ManagedInstance,
    pub node_id: NodeId,
    pub stage: JobStage,
    /// Failed attempts so far.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Run generation the job was admitted under.
    pub generation: u64,
}

impl RebootJob {
    pub fn new(instance: ManagedInstance, node_id: NodeId, started_at: DateTime<Utc>) -> Self {
        Self {
            instance,
            node_id,
            stage: JobStage::Warning,
            attempts: 0,
            started_at,
            last_error: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// `attempts` counts every attempt including the successful one.
    Completed { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// The instance already had an active job.
    Duplicate,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Why a stop or start stage failed.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("instance did not stop after {attempts} stop attempts")]
    StopTimeout { attempts: u32 },

    #[error("instance did not reach running within {}s", timeout.as_secs())]
    StartTimeout { timeout: Duration },

    #[error("control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),
}

/// One broadcast warning and the pause after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningStep {
    pub message: String,
    pub delay_after: Duration,
}

impl WarningStep {
    pub fn new(message: impl Into<String>, delay_after: Duration) -> Self {
        Self {
            message: message.into(),
            delay_after,
        }
    }
}

/// Executor timings and commands.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub warning_steps: Vec<WarningStep>,
    pub broadcast_command: String,
    pub save_command: String,

    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
    /// Stop then kill rounds before the stop stage fails.
    pub stop_attempts: u32,
    pub server_startup_timeout: Duration,

    pub reboot_retry_limit: u32,
    pub max_job_duration: Duration,
    pub retry_backoff_base: Duration,

    /// Fallback status poll while waiting on telemetry.
    pub status_poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            warning_steps: vec![
                WarningStep::new("Server restarting in 5 minutes", Duration::from_secs(240)),
                WarningStep::new("Server restarting in 1 minute", Duration::from_secs(50)),
                WarningStep::new("Server restarting in 10 seconds", Duration::from_secs(10)),
            ],
            broadcast_command: "say".to_string(),
            save_command: "save-all".to_string(),
            stop_timeout: Duration::from_secs(60),
            kill_timeout: Duration::from_secs(30),
            stop_attempts: 3,
            server_startup_timeout: Duration::from_secs(20 * 60),
            reboot_retry_limit: 3,
            max_job_duration: Duration::from_secs(45 * 60),
            retry_backoff_base: Duration::from_secs(10),
            status_poll_interval: Duration::from_secs(15),
        }
    }
}

/// Wait until the instance reports `target`.
///
/// Telemetry updates older than `issued_at` are ignored. A `get_status` poll
/// every `poll_every` covers a silent or closed telemetry stream.
pub async fn wait_for_state(
    control_plane: &dyn ControlPlane,
    handle: &TelemetryHandle,
    target: InstanceState,
    issued_at: Instant,
    timeout: Duration,
    poll_every: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    let mut rx = handle.subscribe();
    let mut poll = tokio::time::interval_at(Instant::now() + poll_every, poll_every);
    let mut stream_open = true;

    loop {
        {
            let stats = rx.borrow_and_update();
            if stats.state == target && stats.last_update.is_some_and(|at| at >= issued_at) {
                return true;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            changed = rx.changed(), if stream_open => {
                if changed.is_err() {
                    stream_open = false;
                }
            }
            _ = poll.tick() => {
                match control_plane.get_status(handle.instance_id()).await {
                    Ok(status) if status.state == target => return true,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(instance_id = %handle.instance_id(), error = %e, "Status poll failed");
                    }
                }
            }
        }
    }
}

pub struct RebootExecutor {
    control_plane: Arc<dyn ControlPlane>,
    telemetry: Arc<TelemetryMonitor>,
    detector: Arc<CrashDetector>,
    context: Arc<OrchestrationContext>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl RebootExecutor {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        telemetry: Arc<TelemetryMonitor>,
        detector: Arc<CrashDetector>,
        context: Arc<OrchestrationContext>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            control_plane,
            telemetry,
            detector,
            context,
            notifier,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Reboot one instance.
    #[instrument(skip_all, fields(instance_id = %instance.id, node_id = %node_id))]
    pub async fn run(&self, instance: &ManagedInstance, node_id: &NodeId) -> JobOutcome {
        let id = &instance.id;
        let started = Instant::now();
        let job = RebootJob::new(instance.clone(), node_id.clone(), self.clock.now());
        if !self.context.try_begin_job(job) {
            info!("Instance already has an active reboot, skipping");
            return JobOutcome::Duplicate;
        }

        info!(name = %instance.name, "Starting reboot");
        let handle = self.telemetry.start(id);
        self.detector.begin_planned_restart(id);

        let outcome = self.execute(id, &handle, started).await;

        self.detector.end_planned_restart(id);
        self.telemetry.stop(handle);

        match &outcome {
            JobOutcome::Completed { attempts } => {
                info!(attempts, "Reboot completed");
                self.context.complete_job(id, Ok(*attempts)).await;
            }
            JobOutcome::Failed { attempts, error } => {
                warn!(attempts, error = %error, "Reboot failed");
                self.context.complete_job(id, Err(error.clone())).await;
                self.notifier
                    .notify(
                        Audience::Staff,
                        &format!(
                            "Reboot of {} ({}) failed after {} attempts: {}",
                            instance.name, id, attempts, error
                        ),
                    )
                    .await;
            }
            JobOutcome::Duplicate => {}
        }

        outcome
    }

    /// `started` is the admission instant; the time ceiling covers the warnings too.
    async fn execute(&self, id: &InstanceId, handle: &TelemetryHandle, started: Instant) -> JobOutcome {
        self.context.set_stage(id, JobStage::Warning);
        self.send_warnings(id).await;

        let mut budget = RetryBudget::new(
            self.config.reboot_retry_limit,
            self.config.max_job_duration,
            self.config.retry_backoff_base,
        );

        loop {
            let error = match self.reboot_once(id, handle).await {
                Ok(()) => {
                    self.context.set_stage(id, JobStage::Completed);
                    return JobOutcome::Completed {
                        attempts: budget.attempts() + 1,
                    };
                }
                Err(e) => e.to_string(),
            };

            let decision = budget.record_failure(started.elapsed());
            let attempts = budget.attempts();
            self.context.update_job(id, |job| {
                job.attempts = attempts;
                job.last_error = Some(error.clone());
            });

            match decision {
                RetryDecision::Retry { attempt, backoff } => {
                    warn!(attempt, error = %error, backoff_secs = backoff.as_secs(), "Reboot attempt failed, retrying");
                    self.context.record_retry(id).await;
                    tokio::time::sleep(backoff).await;
                }
                RetryDecision::AttemptsExhausted { attempts } => {
                    self.context.set_stage(id, JobStage::Failed);
                    return JobOutcome::Failed { attempts, error };
                }
                RetryDecision::DeadlineExceeded { attempts, elapsed } => {
                    self.context.set_stage(id, JobStage::Failed);
                    return JobOutcome::Failed {
                        attempts,
                        error: format!("{error} (gave up after {}s)", elapsed.as_secs()),
                    };
                }
            }
        }
    }

    /// Broadcast warnings then save. Failures are logged and skipped.
    async fn send_warnings(&self, id: &InstanceId) {
        match self.control_plane.get_status(id).await {
            Ok(status) if status.state == InstanceState::Running => {}
            Ok(status) => {
                debug!(state = %status.state, "Instance not running, skipping warnings");
                return;
            }
            Err(e) => debug!(error = %e, "Status check failed, sending warnings anyway"),
        }

        for step in &self.config.warning_steps {
            let command = format!("{} {}", self.config.broadcast_command, step.message);
            if let Err(e) = self.control_plane.send_command(id, &command).await {
                warn!(error = %e, "Failed to send restart warning");
            }
            tokio::time::sleep(step.delay_after).await;
        }

        if let Err(e) = self
            .control_plane
            .send_command(id, &self.config.save_command)
            .await
        {
            warn!(error = %e, "Failed to send save command");
        }
    }

    async fn reboot_once(&self, id: &InstanceId, handle: &TelemetryHandle) -> Result<(), StageError> {
        self.context.set_stage(id, JobStage::Stopping);
        self.stop_stage(id, handle).await?;

        self.context.set_stage(id, JobStage::Starting);
        self.start_stage(id, handle).await
    }

    async fn stop_stage(&self, id: &InstanceId, handle: &TelemetryHandle) -> Result<(), StageError> {
        if let Ok(status) = self.control_plane.get_status(id).await {
            if status.state == InstanceState::Offline {
                debug!("Instance already offline");
                return Ok(());
            }
        }

        for round in 1..=self.config.stop_attempts {
            let issued = Instant::now();
            self.control_plane.power_action(id, PowerAction::Stop).await?;
            if self
                .wait(handle, InstanceState::Offline, issued, self.config.stop_timeout)
                .await
            {
                return Ok(());
            }

            warn!(round, "Graceful stop timed out, killing");
            let issued = Instant::now();
            self.control_plane.power_action(id, PowerAction::Kill).await?;
            if self
                .wait(handle, InstanceState::Offline, issued, self.config.kill_timeout)
                .await
            {
                return Ok(());
            }
        }

        Err(StageError::StopTimeout {
            attempts: self.config.stop_attempts,
        })
    }

    async fn start_stage(&self, id: &InstanceId, handle: &TelemetryHandle) -> Result<(), StageError> {
        let issued = Instant::now();
        self.control_plane.power_action(id, PowerAction::Start).await?;

        let timeout = self.config.server_startup_timeout;
        if self.wait(handle, InstanceState::Running, issued, timeout).await {
            Ok(())
        } else {
            Err(StageError::StartTimeout { timeout })
        }
    }

    async fn wait(
        &self,
        handle: &TelemetryHandle,
        target: InstanceState,
        issued_at: Instant,
        timeout: Duration,
    ) -> bool {
        wait_for_state(
            self.control_plane.as_ref(),
            handle,
            target,
            issued_at,
            timeout,
            self.config.status_poll_interval,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_warnings_total_five_minutes() {
        let config = ExecutorConfig::default();
        let total: Duration = config.warning_steps.iter().map(|s| s.delay_after).sum();
        assert_eq!(total, Duration::from_secs(300));
        assert_eq!(config.warning_steps[0].message, "Server restarting in 5 minutes");
    }

    #[test]
    fn test_stage_error_messages() {
        let err = StageError::StartTimeout {
            timeout: Duration::from_secs(1200),
        };
        assert_eq!(err.to_string(), "instance did not reach running within 1200s");
        assert!(JobStage::Failed.is_terminal());
        assert!(!JobStage::Stopping.is_terminal());
    }
}
