//! Telemetry monitor.
//!
//! Keeps one live subscription per instance, shared by every caller that asks
//! for it. Subscriptions are reference counted: the background task is torn
//! down when the last handle is released. Stream failures are recorded on the
//! handle and the stream is re-established with exponential backoff; they are
//! never surfaced to callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetboot_id::InstanceId;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::control_plane::{ControlPlane, ControlPlaneResult};
use crate::model::{InstanceState, InstanceStatus, ResourceUsage};

/// Stream of status updates for one instance.
pub type TelemetryStream = BoxStream<'static, ControlPlaneResult<InstanceStatus>>;

/// Where telemetry comes from.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Open a stream of status updates. The first item should be the current status.
    async fn subscribe(&self, instance_id: &InstanceId) -> ControlPlaneResult<TelemetryStream>;

    /// One-shot status read.
    async fn snapshot(&self, instance_id: &InstanceId) -> ControlPlaneResult<InstanceStatus>;
}

/// Turns status polling into a telemetry stream.
pub struct PollingTelemetrySource {
    control_plane: Arc<dyn ControlPlane>,
    interval: Duration,
}

impl PollingTelemetrySource {
    pub fn new(control_plane: Arc<dyn ControlPlane>, interval: Duration) -> Self {
        Self {
            control_plane,
            interval,
        }
    }
}

#[async_trait]
impl TelemetrySource for PollingTelemetrySource {
    async fn subscribe(&self, instance_id: &InstanceId) -> ControlPlaneResult<TelemetryStream> {
        // Fail the subscription itself if the instance can't be read at all.
        let initial = self.control_plane.get_status(instance_id).await?;

        let control_plane = Arc::clone(&self.control_plane);
        let id = instance_id.clone();
        let interval = self.interval;

        let polls = stream::unfold((control_plane, id), move |(cp, id)| async move {
            tokio::time::sleep(interval).await;
            let result = cp.get_status(&id).await;
            Some((result, (cp, id)))
        });

        Ok(stream::once(async move { Ok(initial) }).chain(polls).boxed())
    }

    async fn snapshot(&self, instance_id: &InstanceId) -> ControlPlaneResult<InstanceStatus> {
        self.control_plane.get_status(instance_id).await
    }
}

/// Telemetry monitor settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// An update older than this makes the handle unhealthy.
    pub stale_after: Duration,

    /// Backoff between reconnect attempts.
    pub reconnect: BackoffPolicy,

    /// Poll interval for [`PollingTelemetrySource`].
    pub poll_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            reconnect: BackoffPolicy::default(),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Latest known telemetry for an instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryStats {
    pub state: InstanceState,
    pub uptime: Option<Duration>,
    pub resource_usage: ResourceUsage,

    /// When the last update arrived. `None` until the first one.
    pub last_update: Option<Instant>,

    pub connected: bool,
    pub last_error: Option<String>,
}

impl TelemetryStats {
    fn apply(&mut self, status: InstanceStatus) {
        self.state = status.state;
        self.uptime = status.uptime;
        self.resource_usage = status.resource_usage;
        self.last_update = Some(Instant::now());
        self.last_error = None;
    }
}

/// A shared view of one instance's subscription.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    instance_id: InstanceId,
    /// Identifies the subscription this handle was issued from.
    token: u64,
    rx: watch::Receiver<TelemetryStats>,
    stale_after: Duration,
}

impl TelemetryHandle {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn stats(&self) -> TelemetryStats {
        self.rx.borrow().clone()
    }

    /// Connected, no outstanding error and a fresh update.
    pub fn healthy(&self) -> bool {
        let stats = self.rx.borrow();
        stats.connected
            && stats.last_error.is_none()
            && stats
                .last_update
                .map(|at| at.elapsed() <= self.stale_after)
                .unwrap_or(false)
    }

    /// A receiver notified on every update.
    pub fn subscribe(&self) -> watch::Receiver<TelemetryStats> {
        self.rx.clone()
    }
}

struct Subscription {
    token: u64,
    refs: usize,
    rx: watch::Receiver<TelemetryStats>,
    task: JoinHandle<()>,
}

/// Reference-counted telemetry subscriptions.
pub struct TelemetryMonitor {
    source: Arc<dyn TelemetrySource>,
    config: TelemetryConfig,
    subscriptions: Mutex<HashMap<InstanceId, Subscription>>,
    next_token: AtomicU64,
}

impl TelemetryMonitor {
    pub fn new(source: Arc<dyn TelemetrySource>, config: TelemetryConfig) -> Self {
        Self {
            source,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Acquire a handle, starting the subscription if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, instance_id: &InstanceId) -> TelemetryHandle {
        let mut subs = self.lock();

        if let Some(sub) = subs.get_mut(instance_id) {
            sub.refs += 1;
            debug!(instance_id = %instance_id, refs = sub.refs, "Reusing telemetry subscription");
            return self.handle(instance_id, sub.token, sub.rx.clone());
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(TelemetryStats::default());
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.source),
            instance_id.clone(),
            tx,
            self.config.reconnect.clone(),
        ));

        info!(instance_id = %instance_id, "Started telemetry subscription");
        subs.insert(
            instance_id.clone(),
            Subscription {
                token,
                refs: 1,
                rx: rx.clone(),
                task,
            },
        );
        self.handle(instance_id, token, rx)
    }

    /// Release a handle. The subscription stops with its last reference.
    ///
    /// Handles issued before a [`stop_all`](Self::stop_all) no longer count
    /// against the subscription that replaced theirs.
    pub fn stop(&self, handle: TelemetryHandle) {
        let mut subs = self.lock();
        let id = handle.instance_id;

        let Some(sub) = subs.get_mut(&id) else {
            return;
        };
        if sub.token != handle.token {
            debug!(instance_id = %id, "Ignoring release of a torn-down subscription");
            return;
        }
        sub.refs = sub.refs.saturating_sub(1);
        if sub.refs == 0 {
            if let Some(sub) = subs.remove(&id) {
                sub.task.abort();
            }
            info!(instance_id = %id, "Stopped telemetry subscription");
        }
    }

    /// Tear down every subscription regardless of references.
    pub fn stop_all(&self) {
        let mut subs = self.lock();
        let count = subs.len();
        for (_, sub) in subs.drain() {
            sub.task.abort();
        }
        if count > 0 {
            info!(count, "Stopped all telemetry subscriptions");
        }
    }

    /// Current uptime: live data when healthy, otherwise a one-shot snapshot.
    pub async fn uptime(&self, instance_id: &InstanceId) -> Option<Duration> {
        let live = {
            let subs = self.lock();
            subs.get(instance_id)
                .map(|sub| self.handle(instance_id, sub.token, sub.rx.clone()))
        };

        if let Some(handle) = live.filter(|h| h.healthy()) {
            let stats = handle.stats();
            let age = stats.last_update.map(|at| at.elapsed()).unwrap_or_default();
            return stats.uptime.map(|uptime| uptime + age);
        }

        match self.source.snapshot(instance_id).await {
            Ok(status) => status.uptime,
            Err(e) => {
                debug!(instance_id = %instance_id, error = %e, "Uptime snapshot failed");
                None
            }
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().len()
    }

    pub fn ref_count(&self, instance_id: &InstanceId) -> usize {
        self.lock().get(instance_id).map(|s| s.refs).unwrap_or(0)
    }

    fn handle(
        &self,
        instance_id: &InstanceId,
        token: u64,
        rx: watch::Receiver<TelemetryStats>,
    ) -> TelemetryHandle {
        TelemetryHandle {
            instance_id: instance_id.clone(),
            token,
            rx,
            stale_after: self.config.stale_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, Subscription>> {
        self.subscriptions
            .lock()
            .expect("telemetry subscriptions mutex poisoned")
    }
}

impl Drop for TelemetryMonitor {
    fn drop(&mut self) {
        if let Ok(subs) = self.subscriptions.get_mut() {
            for (_, sub) in subs.drain() {
                sub.task.abort();
            }
        }
    }
}

async fn run_subscription(
    source: Arc<dyn TelemetrySource>,
    instance_id: InstanceId,
    tx: watch::Sender<TelemetryStats>,
    backoff: BackoffPolicy,
) {
    let mut failures: u32 = 0;

    loop {
        match source.subscribe(&instance_id).await {
            Ok(mut stream) => {
                failures = 0;
                tx.send_modify(|s| {
                    s.connected = true;
                    s.last_error = None;
                });

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(status) => tx.send_modify(|s| s.apply(status)),
                        Err(e) => {
                            warn!(instance_id = %instance_id, error = %e, "Telemetry update failed");
                            tx.send_modify(|s| s.last_error = Some(e.to_string()));
                        }
                    }
                }

                debug!(instance_id = %instance_id, "Telemetry stream ended");
                tx.send_modify(|s| s.connected = false);
            }
            Err(e) => {
                warn!(
                    instance_id = %instance_id,
                    error = %e,
                    attempt = failures + 1,
                    "Telemetry subscription failed"
                );
                tx.send_modify(|s| {
                    s.connected = false;
                    s.last_error = Some(e.to_string());
                });
            }
        }

        let delay = backoff.delay(failures);
        failures = failures.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::MockControlPlane;

    fn inst(id: &str) -> InstanceId {
        InstanceId::parse(id).unwrap()
    }

    fn monitor(mock: &MockControlPlane) -> TelemetryMonitor {
        TelemetryMonitor::new(Arc::new(mock.clone()), TelemetryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_reference_counted() {
        let mock = MockControlPlane::new();
        let id = inst("alpha");
        mock.add_instance(&id, InstanceState::Running, None);
        let monitor = monitor(&mock);

        let first = monitor.start(&id);
        let second = monitor.start(&id);
        assert_eq!(monitor.active_subscriptions(), 1);
        assert_eq!(monitor.ref_count(&id), 2);

        monitor.stop(first);
        assert_eq!(monitor.active_subscriptions(), 1);
        monitor.stop(second);
        assert_eq!(monitor.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_from_before_stop_all_is_ignored() {
        let mock = MockControlPlane::new();
        let id = inst("alpha");
        mock.add_instance(&id, InstanceState::Running, None);
        let monitor = monitor(&mock);

        let old = monitor.start(&id);
        monitor.stop_all();
        let fresh = monitor.start(&id);
        assert_eq!(monitor.ref_count(&id), 1);

        monitor.stop(old);
        assert_eq!(monitor.ref_count(&id), 1);
        assert_eq!(monitor.active_subscriptions(), 1);

        monitor.stop(fresh);
        assert_eq!(monitor.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_then_stale() {
        let mock = MockControlPlane::new();
        let id = inst("alpha");
        mock.add_instance(&id, InstanceState::Running, Some(Duration::from_secs(60)));
        let monitor = monitor(&mock);

        let handle = monitor.start(&id);
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.last_update.is_some()).await.unwrap();

        assert!(handle.healthy());
        assert_eq!(handle.stats().state, InstanceState::Running);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!handle.healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_errors_recorded_on_handle() {
        let mock = MockControlPlane::new();
        let id = inst("alpha");
        mock.add_instance(&id, InstanceState::Running, None);
        mock.fail_subscriptions(true);
        let monitor = monitor(&mock);

        let handle = monitor.start(&id);
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.last_error.is_some()).await.unwrap();
        assert!(!handle.healthy());
        assert!(!handle.stats().connected);

        mock.fail_subscriptions(false);
        rx.wait_for(|s| s.connected && s.last_update.is_some())
            .await
            .unwrap();
        assert!(handle.healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_falls_back_to_snapshot() {
        let mock = MockControlPlane::new();
        let id = inst("alpha");
        mock.add_instance(&id, InstanceState::Running, Some(Duration::from_secs(7200)));
        let monitor = monitor(&mock);

        let uptime = monitor.uptime(&id).await.unwrap();
        assert!(uptime >= Duration::from_secs(7200));
        assert!(monitor.uptime(&inst("missing")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_source_yields_status() {
        let mock = MockControlPlane::new();
        let id = inst("alpha");
        mock.add_instance(&id, InstanceState::Offline, None);
        let source = PollingTelemetrySource::new(Arc::new(mock.clone()), Duration::from_secs(5));

        let mut stream = source.subscribe(&id).await.unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap().state,
            InstanceState::Offline
        );

        mock.set_state(&id, InstanceState::Starting);
        assert_eq!(
            stream.next().await.unwrap().unwrap().state,
            InstanceState::Starting
        );
    }
}
