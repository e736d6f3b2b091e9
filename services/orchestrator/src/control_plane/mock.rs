//! In-process control plane simulation.
//!
//! Instances move through `stopping`/`starting` after configurable delays and
//! every state change is pushed to telemetry subscribers, so the engine can be
//! driven end to end under a paused tokio clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetboot_id::InstanceId;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::{ControlPlane, ControlPlaneError, ControlPlaneResult, PowerAction};
use crate::model::{InstanceState, InstanceStatus, WorkerNode};
use crate::telemetry::{TelemetrySource, TelemetryStream};

/// A call received by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub at: Instant,
    pub instance_id: InstanceId,
    pub kind: MockCallKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockCallKind {
    Command(String),
    Power(PowerAction),
}

#[derive(Debug, Default)]
struct MockInstance {
    state: InstanceState,
    running_since: Option<Instant>,
    /// Bumped whenever a delayed transition is scheduled; stale timers check it.
    generation: u64,
    ignore_stop: bool,
    ignore_kill: bool,
    hang_on_start: bool,
    power_failures: u32,
}

impl MockInstance {
    fn set_state(&mut self, state: InstanceState, now: Instant) {
        if state == InstanceState::Running && self.state != InstanceState::Running {
            self.running_since = Some(now);
        } else if state != InstanceState::Running {
            self.running_since = None;
        }
        self.state = state;
    }

    fn status(&self, now: Instant) -> InstanceStatus {
        InstanceStatus {
            state: self.state,
            uptime: self.running_since.map(|since| now.duration_since(since)),
            ..InstanceStatus::default()
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    instances: HashMap<InstanceId, MockInstance>,
    calls: Vec<MockCall>,
    nodes: Option<Vec<WorkerNode>>,
    fail_subscriptions: bool,
}

struct Shared {
    state: Mutex<MockState>,
    updates: broadcast::Sender<(InstanceId, InstanceStatus)>,
    stop_delay: Duration,
    start_delay: Duration,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock control plane mutex poisoned")
    }

    fn publish(&self, instance_id: InstanceId, status: InstanceStatus) {
        // No subscribers is fine.
        let _ = self.updates.send((instance_id, status));
    }

    /// Apply a state change now and push it to subscribers.
    fn transition(&self, instance_id: &InstanceId, state: InstanceState) {
        let status = {
            let mut st = self.lock();
            let Some(instance) = st.instances.get_mut(instance_id) else {
                return;
            };
            let now = Instant::now();
            instance.set_state(state, now);
            instance.status(now)
        };
        debug!(instance_id = %instance_id, state = %state, "[MOCK] State changed");
        self.publish(instance_id.clone(), status);
    }
}

/// Simulated control plane for tests and dry runs.
#[derive(Clone)]
pub struct MockControlPlane {
    shared: Arc<Shared>,
}

impl MockControlPlane {
    /// Create a mock with 2s stop and 5s start delays.
    pub fn new() -> Self {
        Self::with_delays(Duration::from_secs(2), Duration::from_secs(5))
    }

    pub fn with_delays(stop_delay: Duration, start_delay: Duration) -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState::default()),
                updates,
                stop_delay,
                start_delay,
            }),
        }
    }

    /// Register an instance. `uptime` backdates the running start.
    pub fn add_instance(&self, id: &InstanceId, state: InstanceState, uptime: Option<Duration>) {
        let now = Instant::now();
        let mut instance = MockInstance::default();
        instance.set_state(state, now);
        if let (InstanceState::Running, Some(uptime)) = (state, uptime) {
            instance.running_since = Some(now.checked_sub(uptime).unwrap_or(now));
        }
        self.shared.lock().instances.insert(id.clone(), instance);
    }

    /// Nodes returned by `list_nodes`. `None` makes the listing fail.
    pub fn set_nodes(&self, nodes: Option<Vec<WorkerNode>>) {
        self.shared.lock().nodes = nodes;
    }

    /// Ignore both stop and kill for this instance.
    pub fn make_unstoppable(&self, id: &InstanceId) {
        self.update(id, |i| {
            i.ignore_stop = true;
            i.ignore_kill = true;
        });
    }

    /// Ignore graceful stop only; kill still works.
    pub fn ignore_graceful_stop(&self, id: &InstanceId) {
        self.update(id, |i| i.ignore_stop = true);
    }

    /// Leave the instance in `starting` forever after a start.
    pub fn hang_on_start(&self, id: &InstanceId) {
        self.update(id, |i| i.hang_on_start = true);
    }

    /// Fail the next `count` power actions with a transient error.
    pub fn fail_power_actions(&self, id: &InstanceId, count: u32) {
        self.update(id, |i| i.power_failures = count);
    }

    /// Make telemetry subscriptions fail.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.shared.lock().fail_subscriptions = fail;
    }

    /// Force a state change, as if the instance crashed or was started externally.
    pub fn set_state(&self, id: &InstanceId, state: InstanceState) {
        self.update(id, |i| i.generation += 1);
        self.shared.transition(id, state);
    }

    pub fn state_of(&self, id: &InstanceId) -> Option<InstanceState> {
        self.shared.lock().instances.get(id).map(|i| i.state)
    }

    /// All calls received so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.shared.lock().calls.clone()
    }

    pub fn calls_for(&self, id: &InstanceId) -> Vec<MockCall> {
        self.shared
            .lock()
            .calls
            .iter()
            .filter(|c| &c.instance_id == id)
            .cloned()
            .collect()
    }

    pub fn power_actions(&self, id: &InstanceId) -> Vec<PowerAction> {
        self.calls_for(id)
            .into_iter()
            .filter_map(|c| match c.kind {
                MockCallKind::Power(action) => Some(action),
                MockCallKind::Command(_) => None,
            })
            .collect()
    }

    fn update(&self, id: &InstanceId, f: impl FnOnce(&mut MockInstance)) {
        if let Some(instance) = self.shared.lock().instances.get_mut(id) {
            f(instance);
        }
    }

    fn schedule(&self, id: &InstanceId, generation: u64, delay: Duration, target: InstanceState) {
        let shared = Arc::clone(&self.shared);
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = shared
                .lock()
                .instances
                .get(&id)
                .map(|i| i.generation == generation)
                .unwrap_or(false);
            if current {
                shared.transition(&id, target);
            }
        });
    }

    fn current_status(&self, id: &InstanceId) -> ControlPlaneResult<InstanceStatus> {
        let st = self.shared.lock();
        st.instances
            .get(id)
            .map(|i| i.status(Instant::now()))
            .ok_or_else(|| ControlPlaneError::NotFound(id.clone()))
    }
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn send_command(
        &self,
        instance_id: &InstanceId,
        command: &str,
    ) -> ControlPlaneResult<()> {
        let mut st = self.shared.lock();
        st.calls.push(MockCall {
            at: Instant::now(),
            instance_id: instance_id.clone(),
            kind: MockCallKind::Command(command.to_string()),
        });

        match st.instances.get(instance_id) {
            None => Err(ControlPlaneError::NotFound(instance_id.clone())),
            Some(i) if i.state != InstanceState::Running => Err(ControlPlaneError::Status {
                status: 409,
                body: "instance is not running".to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    async fn power_action(
        &self,
        instance_id: &InstanceId,
        action: PowerAction,
    ) -> ControlPlaneResult<()> {
        enum Effect {
            None,
            Now(InstanceState),
            Later(InstanceState, u64, InstanceState, Duration),
        }

        let effect = {
            let mut st = self.shared.lock();
            st.calls.push(MockCall {
                at: Instant::now(),
                instance_id: instance_id.clone(),
                kind: MockCallKind::Power(action),
            });

            let Some(instance) = st.instances.get_mut(instance_id) else {
                return Err(ControlPlaneError::NotFound(instance_id.clone()));
            };

            if instance.power_failures > 0 {
                instance.power_failures -= 1;
                return Err(ControlPlaneError::Unavailable(
                    "simulated power failure".to_string(),
                ));
            }

            match action {
                PowerAction::Stop => {
                    if instance.ignore_stop
                        || !matches!(
                            instance.state,
                            InstanceState::Running | InstanceState::Starting
                        )
                    {
                        Effect::None
                    } else {
                        instance.generation += 1;
                        Effect::Later(
                            InstanceState::Stopping,
                            instance.generation,
                            InstanceState::Offline,
                            self.shared.stop_delay,
                        )
                    }
                }
                PowerAction::Kill => {
                    if instance.ignore_kill || instance.state == InstanceState::Offline {
                        Effect::None
                    } else {
                        instance.generation += 1;
                        Effect::Now(InstanceState::Offline)
                    }
                }
                PowerAction::Start => {
                    if !matches!(
                        instance.state,
                        InstanceState::Offline | InstanceState::Unknown
                    ) {
                        Effect::None
                    } else if instance.hang_on_start {
                        instance.generation += 1;
                        Effect::Now(InstanceState::Starting)
                    } else {
                        instance.generation += 1;
                        Effect::Later(
                            InstanceState::Starting,
                            instance.generation,
                            InstanceState::Running,
                            self.shared.start_delay,
                        )
                    }
                }
            }
        };

        match effect {
            Effect::None => {}
            Effect::Now(state) => self.shared.transition(instance_id, state),
            Effect::Later(now_state, generation, target, delay) => {
                self.shared.transition(instance_id, now_state);
                self.schedule(instance_id, generation, delay, target);
            }
        }

        Ok(())
    }

    async fn get_status(&self, instance_id: &InstanceId) -> ControlPlaneResult<InstanceStatus> {
        self.current_status(instance_id)
    }

    async fn list_nodes(&self) -> ControlPlaneResult<Vec<WorkerNode>> {
        self.shared
            .lock()
            .nodes
            .clone()
            .ok_or_else(|| ControlPlaneError::Unavailable("node listing disabled".to_string()))
    }
}

#[async_trait]
impl TelemetrySource for MockControlPlane {
    async fn subscribe(&self, instance_id: &InstanceId) -> ControlPlaneResult<TelemetryStream> {
        if self.shared.lock().fail_subscriptions {
            return Err(ControlPlaneError::Unavailable(
                "telemetry subscription refused".to_string(),
            ));
        }

        let rx = self.shared.updates.subscribe();
        let initial = self.current_status(instance_id)?;
        let id = instance_id.clone();

        let updates = stream::unfold((rx, id), |(mut rx, id)| async move {
            loop {
                match rx.recv().await {
                    Ok((uid, status)) if uid == id => return Some((Ok(status), (rx, id))),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::once(async move { Ok(initial) }).chain(updates).boxed())
    }

    async fn snapshot(&self, instance_id: &InstanceId) -> ControlPlaneResult<InstanceStatus> {
        self.current_status(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(id: &str) -> InstanceId {
        InstanceId::parse(id).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_cycle() {
        let mock = MockControlPlane::with_delays(Duration::from_secs(1), Duration::from_secs(3));
        let id = inst("alpha");
        mock.add_instance(&id, InstanceState::Running, Some(Duration::from_secs(3600)));

        mock.power_action(&id, PowerAction::Stop).await.unwrap();
        assert_eq!(mock.state_of(&id), Some(InstanceState::Stopping));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.state_of(&id), Some(InstanceState::Offline));

        mock.power_action(&id, PowerAction::Start).await.unwrap();
        assert_eq!(mock.state_of(&id), Some(InstanceState::Starting));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(mock.state_of(&id), Some(InstanceState::Running));

        assert_eq!(
            mock.power_actions(&id),
            vec![PowerAction::Stop, PowerAction::Start]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstoppable_instance() {
        let mock = MockControlPlane::new();
        let id = inst("stuck");
        mock.add_instance(&id, InstanceState::Running, None);
        mock.make_unstoppable(&id);

        mock.power_action(&id, PowerAction::Stop).await.unwrap();
        mock.power_action(&id, PowerAction::Kill).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.state_of(&id), Some(InstanceState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_pushes_changes() {
        let mock = MockControlPlane::new();
        let id = inst("alpha");
        mock.add_instance(&id, InstanceState::Offline, None);

        let mut stream = mock.subscribe(&id).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.state, InstanceState::Offline);

        mock.set_state(&id, InstanceState::Starting);
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.state, InstanceState::Starting);
    }

    #[tokio::test]
    async fn test_power_failures_are_transient() {
        let mock = MockControlPlane::new();
        let id = inst("flaky");
        mock.add_instance(&id, InstanceState::Offline, None);
        mock.fail_power_actions(&id, 1);

        let err = mock.power_action(&id, PowerAction::Start).await.unwrap_err();
        assert!(err.is_transient());
    }
}
