//! Health and crash detection.
//!
//! The detector keeps a short state-transition history per instance and
//! classifies it:
//!
//! - `running -> offline` shortly after reaching `running` is an unexpected stop.
//! - `offline -> starting` with enough recent unexpected stops is a crash loop.
//!   Only one crash loop is reported per window. Failed starts are reported on
//!   their own and do not count toward the loop threshold.
//! - `running -> starting` means the `offline` in between was missed, which
//!   happens with polled telemetry. It is handled as `running -> offline`
//!   followed by `offline -> starting`.
//! - An instance that stays in the same `starting` episode past the starting
//!   timeout failed to start.
//!
//! Reboots driven by the executor are bracketed with
//! [`CrashDetector::begin_planned_restart`] and
//! [`CrashDetector::end_planned_restart`] so they are not mistaken for crashes.
//!
//! Persistence and notification failures are logged, never returned.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetboot_id::InstanceId;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{to_delta, Clock};
use crate::model::{CrashEvent, CrashKind, InstanceState, StateTransition};
use crate::notify::{Audience, Notifier};
use crate::state::Store;
use crate::telemetry::TelemetryHandle;

/// Crash detector thresholds.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// A stop sooner than this after reaching `running` is a crash.
    pub minimum_uptime_before_crash: Duration,
    pub crash_loop_threshold: usize,
    pub crash_loop_window: Duration,
    pub starting_timeout: Duration,

    /// Recent crashes needed before a recovery notice is sent.
    pub recovery_notice_threshold: usize,

    pub history_retention: Duration,
    pub crash_retention: Duration,
    pub max_crashes_per_instance: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            minimum_uptime_before_crash: Duration::from_secs(120),
            crash_loop_threshold: 3,
            crash_loop_window: Duration::from_secs(600),
            starting_timeout: Duration::from_secs(900),
            recovery_notice_threshold: 2,
            history_retention: Duration::from_secs(1800),
            crash_retention: Duration::from_secs(3600),
            max_crashes_per_instance: 64,
        }
    }
}

/// Display-oriented health summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHealth {
    pub current_state: InstanceState,
    pub recent_crashes: usize,
    pub status_text: &'static str,
}

#[derive(Debug, Default)]
struct InstanceTrack {
    state: InstanceState,
    last_uptime: Option<Duration>,
    transitions: VecDeque<StateTransition>,
    crashes: VecDeque<CrashEvent>,
    starting_episode: u64,
    starting_timer: Option<JoinHandle<()>>,
    planned_restart: bool,
}

impl InstanceTrack {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.starting_timer.take() {
            timer.abort();
        }
    }

    fn crashes_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> impl Iterator<Item = &CrashEvent> + '_ {
        let cutoff = now - to_delta(window);
        self.crashes.iter().filter(move |c| c.timestamp >= cutoff)
    }

    /// How long the instance had been running when it went offline.
    fn running_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        // Skip the transition just appended.
        let entry = self
            .transitions
            .iter()
            .rev()
            .skip(1)
            .find(|t| t.to_state == InstanceState::Running);

        match entry {
            Some(t) => {
                let elapsed = (now - t.timestamp).to_std().unwrap_or_default();
                // First sighting while already running: add the uptime it reported.
                let carried = if t.from_state == InstanceState::Unknown {
                    t.uptime_secs.map(Duration::from_secs).unwrap_or_default()
                } else {
                    Duration::ZERO
                };
                Some(elapsed + carried)
            }
            None => self.last_uptime,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, config: &DetectorConfig) {
        let history_cutoff = now - to_delta(config.history_retention);
        while self
            .transitions
            .front()
            .is_some_and(|t| t.timestamp < history_cutoff)
        {
            self.transitions.pop_front();
        }

        let crash_cutoff = now - to_delta(config.crash_retention);
        while self
            .crashes
            .front()
            .is_some_and(|c| c.timestamp < crash_cutoff)
        {
            self.crashes.pop_front();
        }
        while self.crashes.len() > config.max_crashes_per_instance {
            self.crashes.pop_front();
        }
    }
}

/// Work produced under the lock and carried out after it is released.
#[derive(Default)]
struct Effects {
    transitions: Vec<StateTransition>,
    crashes: Vec<CrashEvent>,
    notices: Vec<String>,
}

impl Effects {
    fn merge(&mut self, other: Effects) {
        self.transitions.extend(other.transitions);
        self.crashes.extend(other.crashes);
        self.notices.extend(other.notices);
    }
}

pub struct CrashDetector {
    config: DetectorConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    tracks: Mutex<HashMap<InstanceId, InstanceTrack>>,
}

impl CrashDetector {
    pub fn new(
        config: DetectorConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            clock,
            store,
            notifier,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceId, InstanceTrack>> {
        self.tracks.lock().expect("crash detector mutex poisoned")
    }

    /// Feed an observed state. Returns the crash events it produced.
    pub async fn observe(
        self: &Arc<Self>,
        instance_id: &InstanceId,
        state: InstanceState,
        uptime: Option<Duration>,
    ) -> Vec<CrashEvent> {
        let effects = {
            let mut tracks = self.lock();
            let track = tracks.entry(instance_id.clone()).or_default();
            if track.state == InstanceState::Running && state == InstanceState::Starting {
                debug!(instance_id = %instance_id, "Missed offline between running and starting");
                let mut effects = self.apply(instance_id, track, InstanceState::Offline, None);
                effects.merge(self.apply(instance_id, track, state, uptime));
                effects
            } else {
                self.apply(instance_id, track, state, uptime)
            }
        };

        self.carry_out(instance_id, effects).await
    }

    fn apply(
        self: &Arc<Self>,
        instance_id: &InstanceId,
        track: &mut InstanceTrack,
        state: InstanceState,
        uptime: Option<Duration>,
    ) -> Effects {
        let mut effects = Effects::default();

        if state == InstanceState::Running && uptime.is_some() {
            track.last_uptime = uptime;
        }
        if track.state == state {
            return effects;
        }

        let now = self.clock.now();
        let from = track.state;
        let transition = StateTransition {
            instance_id: instance_id.clone(),
            from_state: from,
            to_state: state,
            timestamp: now,
            uptime_secs: uptime.map(|u| u.as_secs()),
        };
        track.transitions.push_back(transition.clone());
        track.state = state;
        effects.transitions.push(transition);

        debug!(instance_id = %instance_id, from = %from, to = %state, "State transition");

        if from == InstanceState::Starting {
            track.cancel_timer();
        }

        match (from, state) {
            (InstanceState::Running, InstanceState::Offline) if !track.planned_restart => {
                match track.running_for(now) {
                    Some(ran) if ran < self.config.minimum_uptime_before_crash => {
                        let event = CrashEvent {
                            kind: CrashKind::UnexpectedStop,
                            instance_id: instance_id.clone(),
                            timestamp: now,
                            metadata: json!({ "uptime_secs": ran.as_secs() }),
                        };
                        track.crashes.push_back(event.clone());
                        effects.crashes.push(event);
                    }
                    Some(_) => {}
                    None => {
                        debug!(instance_id = %instance_id, "No uptime known, stop not classified");
                    }
                }
            }
            (InstanceState::Offline, InstanceState::Starting) if !track.planned_restart => {
                let window = self.config.crash_loop_window;
                let recent = track
                    .crashes_within(now, window)
                    .filter(|c| c.kind == CrashKind::UnexpectedStop)
                    .count();
                let already_reported = track
                    .crashes_within(now, window)
                    .any(|c| c.kind == CrashKind::CrashLoop);

                if recent >= self.config.crash_loop_threshold && !already_reported {
                    let event = CrashEvent {
                        kind: CrashKind::CrashLoop,
                        instance_id: instance_id.clone(),
                        timestamp: now,
                        metadata: json!({
                            "crashes": recent,
                            "window_secs": window.as_secs(),
                        }),
                    };
                    track.crashes.push_back(event.clone());
                    effects.crashes.push(event);
                    effects.notices.push(format!(
                        "Instance {instance_id} is crash looping: {recent} crashes in the last {} minutes",
                        window.as_secs() / 60
                    ));
                }
            }
            (InstanceState::Starting, InstanceState::Running) => {
                let recent = track
                    .crashes_within(now, self.config.crash_loop_window)
                    .filter(|c| c.kind != CrashKind::CrashLoop)
                    .count();
                if recent >= self.config.recovery_notice_threshold {
                    effects.notices.push(format!(
                        "Instance {instance_id} is running again after {recent} recent crashes"
                    ));
                }
            }
            _ => {}
        }

        if state == InstanceState::Starting {
            track.starting_episode += 1;
            let episode = track.starting_episode;
            let detector = Arc::clone(self);
            let id = instance_id.clone();
            let timeout = self.config.starting_timeout;
            track.starting_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                detector.starting_timed_out(&id, episode).await;
            }));
        }

        track.prune(now, &self.config);
        effects
    }

    async fn starting_timed_out(&self, instance_id: &InstanceId, episode: u64) {
        let effects = {
            let mut tracks = self.lock();
            let Some(track) = tracks.get_mut(instance_id) else {
                return;
            };
            if track.state != InstanceState::Starting || track.starting_episode != episode {
                return;
            }
            track.starting_timer = None;

            let now = self.clock.now();
            let timeout = self.config.starting_timeout;
            let event = CrashEvent {
                kind: CrashKind::FailedStart,
                instance_id: instance_id.clone(),
                timestamp: now,
                metadata: json!({ "timeout_secs": timeout.as_secs() }),
            };
            track.crashes.push_back(event.clone());
            track.prune(now, &self.config);

            let mut effects = Effects {
                crashes: vec![event],
                ..Effects::default()
            };
            // The executor reports its own stuck starts.
            if !track.planned_restart {
                effects.notices.push(format!(
                    "Instance {instance_id} failed to start within {} minutes",
                    timeout.as_secs() / 60
                ));
            }
            effects
        };

        self.carry_out(instance_id, effects).await;
    }

    async fn carry_out(&self, instance_id: &InstanceId, effects: Effects) -> Vec<CrashEvent> {
        for transition in &effects.transitions {
            if let Err(e) = self.store.append_state_transition(instance_id, transition).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to persist state transition");
            }
        }

        for crash in &effects.crashes {
            warn!(instance_id = %instance_id, kind = %crash.kind, "Crash detected");
            if let Err(e) = self.store.append_crash_event(instance_id, crash).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to persist crash event");
            }
        }

        for notice in &effects.notices {
            self.notifier.notify(Audience::Staff, notice).await;
        }

        effects.crashes
    }

    /// Suppress crash classification while the executor reboots the instance.
    pub fn begin_planned_restart(&self, instance_id: &InstanceId) {
        self.lock()
            .entry(instance_id.clone())
            .or_default()
            .planned_restart = true;
    }

    pub fn end_planned_restart(&self, instance_id: &InstanceId) {
        if let Some(track) = self.lock().get_mut(instance_id) {
            track.planned_restart = false;
        }
    }

    pub fn status(&self, instance_id: &InstanceId) -> InstanceHealth {
        let tracks = self.lock();
        let Some(track) = tracks.get(instance_id) else {
            return InstanceHealth {
                current_state: InstanceState::Unknown,
                recent_crashes: 0,
                status_text: "",
            };
        };

        let now = self.clock.now();
        let window = self.config.crash_loop_window;
        let crash_loop = track
            .crashes_within(now, window)
            .any(|c| c.kind == CrashKind::CrashLoop);
        let recent = track
            .crashes_within(now, window)
            .filter(|c| c.kind != CrashKind::CrashLoop)
            .count();

        let status_text = if crash_loop {
            "(CRASH LOOP!)"
        } else if recent > 0
            && matches!(track.state, InstanceState::Starting | InstanceState::Offline)
        {
            "(CRASHED, starting back!)"
        } else if recent > 0 {
            "(recently crashed)"
        } else {
            ""
        };

        InstanceHealth {
            current_state: track.state,
            recent_crashes: recent,
            status_text,
        }
    }

    /// Feed a telemetry handle's updates into [`CrashDetector::observe`].
    pub fn follow(self: &Arc<Self>, handle: TelemetryHandle) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let instance_id = handle.instance_id().clone();
            let mut rx = handle.subscribe();
            loop {
                let observed = {
                    let stats = rx.borrow_and_update();
                    stats.last_update.map(|_| (stats.state, stats.uptime))
                };
                if let Some((state, uptime)) = observed {
                    detector.observe(&instance_id, state, uptime).await;
                }
                if rx.changed().await.is_err() {
                    debug!(instance_id = %instance_id, "Telemetry closed, no longer following");
                    break;
                }
            }
        })
    }

    /// Drop expired history for every instance.
    pub fn prune(&self) {
        let now = self.clock.now();
        let mut tracks = self.lock();
        for track in tracks.values_mut() {
            track.prune(now, &self.config);
        }
    }

    /// Forget everything about an instance.
    pub fn forget(&self, instance_id: &InstanceId) {
        if let Some(mut track) = self.lock().remove(instance_id) {
            track.cancel_timer();
            info!(instance_id = %instance_id, "Cleared health history");
        }
    }

    /// Crash events currently retained for an instance, oldest first.
    pub fn crash_history(&self, instance_id: &InstanceId) -> Vec<CrashEvent> {
        self.lock()
            .get(instance_id)
            .map(|t| t.crashes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn transition_count(&self, instance_id: &InstanceId) -> usize {
        self.lock()
            .get(instance_id)
            .map(|t| t.transitions.len())
            .unwrap_or(0)
    }
}

impl Drop for CrashDetector {
    fn drop(&mut self) {
        if let Ok(tracks) = self.tracks.get_mut() {
            for track in tracks.values_mut() {
                track.cancel_timer();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::RecordingNotifier;
    use crate::state::MemoryStore;
    use chrono::TimeZone;
    use rstest::rstest;

    struct Harness {
        detector: Arc<CrashDetector>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        id: InstanceId,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 10, 16, 4, 0, 0).unwrap(),
            ));
            let store = Arc::new(MemoryStore::new());
            let notifier = Arc::new(RecordingNotifier::new());
            let detector = Arc::new(CrashDetector::new(
                DetectorConfig::default(),
                clock.clone(),
                store.clone(),
                notifier.clone(),
            ));
            Self {
                detector,
                clock,
                store,
                notifier,
                id: InstanceId::parse("survival-1").unwrap(),
            }
        }

        async fn observe(&self, state: InstanceState) -> Vec<CrashEvent> {
            self.detector.observe(&self.id, state, None).await
        }

        /// offline -> starting -> running, then offline after `ran`.
        async fn crash_after(&self, ran: Duration) -> Vec<CrashEvent> {
            let mut events = self.observe(InstanceState::Offline).await;
            events.extend(self.observe(InstanceState::Starting).await);
            events.extend(self.observe(InstanceState::Running).await);
            self.clock.advance(ran);
            events.extend(self.observe(InstanceState::Offline).await);
            events
        }
    }

    #[rstest]
    #[case::well_under(30, true)]
    #[case::just_under(119, true)]
    #[case::at_boundary(120, false)]
    #[case::long_run(3600, false)]
    #[tokio::test(start_paused = true)]
    async fn test_unexpected_stop_boundary(#[case] ran_secs: u64, #[case] crash: bool) {
        let h = Harness::new();
        let events = h.crash_after(Duration::from_secs(ran_secs)).await;

        let stops: Vec<_> = events
            .iter()
            .filter(|e| e.kind == CrashKind::UnexpectedStop)
            .collect();
        assert_eq!(stops.len(), usize::from(crash));
        assert_eq!(h.store.crash_events().len(), usize::from(crash));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_state_is_noop() {
        let h = Harness::new();
        h.observe(InstanceState::Running).await;
        h.observe(InstanceState::Running).await;
        assert_eq!(h.detector.transition_count(&h.id), 1);
        assert_eq!(h.store.transitions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sighting_uses_reported_uptime() {
        let h = Harness::new();
        // Already up for an hour when first seen.
        h.detector
            .observe(&h.id, InstanceState::Running, Some(Duration::from_secs(3600)))
            .await;
        h.clock.advance(Duration::from_secs(10));
        assert!(h.observe(InstanceState::Offline).await.is_empty());

        let h = Harness::new();
        h.detector
            .observe(&h.id, InstanceState::Running, Some(Duration::from_secs(20)))
            .await;
        h.clock.advance(Duration::from_secs(10));
        let events = h.observe(InstanceState::Offline).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata["uptime_secs"], 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruned_history_falls_back_to_last_uptime() {
        let h = Harness::new();
        h.observe(InstanceState::Starting).await;
        h.detector
            .observe(&h.id, InstanceState::Running, Some(Duration::from_secs(5)))
            .await;
        // Running entry ages out of the 30 minute history.
        h.clock.advance(Duration::from_secs(31 * 60));
        h.detector.prune();
        h.detector
            .observe(&h.id, InstanceState::Running, Some(Duration::from_secs(60)))
            .await;

        let events = h.observe(InstanceState::Offline).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata["uptime_secs"], 60);
    }

    #[rstest]
    #[case::two_crashes(2, 0)]
    #[case::three_crashes(3, 1)]
    #[case::five_crashes(5, 1)]
    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_threshold(#[case] crashes: usize, #[case] loops: usize) {
        let h = Harness::new();
        for _ in 0..crashes {
            h.crash_after(Duration::from_secs(20)).await;
            h.clock.advance(Duration::from_secs(10));
        }
        // The next start evaluates the window.
        h.observe(InstanceState::Starting).await;

        let loop_events = h
            .detector
            .crash_history(&h.id)
            .into_iter()
            .filter(|e| e.kind == CrashKind::CrashLoop)
            .count();
        assert_eq!(loop_events, loops);
        assert_eq!(h.notifier.count_containing("crash looping"), loops);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_starts_do_not_count_toward_loop() {
        let h = Harness::new();
        for _ in 0..2 {
            h.crash_after(Duration::from_secs(20)).await;
        }
        h.observe(InstanceState::Starting).await;
        tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;
        h.observe(InstanceState::Offline).await;
        h.observe(InstanceState::Starting).await;

        let kinds: Vec<CrashKind> = h.detector.crash_history(&h.id).iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CrashKind::UnexpectedStop,
                CrashKind::UnexpectedStop,
                CrashKind::FailedStart,
            ]
        );
        assert_eq!(h.notifier.count_containing("crash looping"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_to_starting_implies_a_stop() {
        let h = Harness::new();
        h.observe(InstanceState::Starting).await;
        for _ in 0..3 {
            h.observe(InstanceState::Running).await;
            h.clock.advance(Duration::from_secs(20));
            // The offline in between was never observed.
            h.observe(InstanceState::Starting).await;
        }

        let kinds: Vec<CrashKind> = h.detector.crash_history(&h.id).iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CrashKind::UnexpectedStop,
                CrashKind::UnexpectedStop,
                CrashKind::UnexpectedStop,
                CrashKind::CrashLoop,
            ]
        );
        assert_eq!(h.notifier.count_containing("crash looping"), 1);

        let states: Vec<_> = h.store.transitions().iter().map(|t| t.to_state).collect();
        assert_eq!(&states[1..4], &[InstanceState::Running, InstanceState::Offline, InstanceState::Starting]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_outside_window_not_counted() {
        let h = Harness::new();
        for _ in 0..3 {
            h.crash_after(Duration::from_secs(20)).await;
            h.clock.advance(Duration::from_secs(5 * 60));
        }
        h.observe(InstanceState::Starting).await;
        assert_eq!(h.notifier.count_containing("crash looping"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_after_timeout() {
        let h = Harness::new();
        h.observe(InstanceState::Offline).await;
        h.observe(InstanceState::Starting).await;

        tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;

        let history = h.detector.crash_history(&h.id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, CrashKind::FailedStart);
        assert_eq!(h.notifier.count_containing("failed to start"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_starting_cancels_timeout() {
        let h = Harness::new();
        h.observe(InstanceState::Starting).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        h.observe(InstanceState::Running).await;

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert!(h.detector.crash_history(&h.id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_starting_episode_restarts_timer() {
        let h = Harness::new();
        h.observe(InstanceState::Starting).await;
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        h.observe(InstanceState::Offline).await;
        h.observe(InstanceState::Starting).await;

        // 16 minutes after the first start, 6 after the second.
        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        assert!(h.detector.crash_history(&h.id).is_empty());

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(h.detector.crash_history(&h.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_notice() {
        let h = Harness::new();
        h.crash_after(Duration::from_secs(20)).await;
        h.crash_after(Duration::from_secs(20)).await;
        h.observe(InstanceState::Starting).await;
        h.observe(InstanceState::Running).await;
        assert_eq!(h.notifier.count_containing("running again"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_text() {
        let h = Harness::new();
        assert_eq!(h.detector.status(&h.id).status_text, "");

        h.crash_after(Duration::from_secs(20)).await;
        let health = h.detector.status(&h.id);
        assert_eq!(health.current_state, InstanceState::Offline);
        assert_eq!(health.recent_crashes, 1);
        assert_eq!(health.status_text, "(CRASHED, starting back!)");

        h.observe(InstanceState::Starting).await;
        h.observe(InstanceState::Running).await;
        assert_eq!(h.detector.status(&h.id).status_text, "(recently crashed)");

        h.clock.advance(Duration::from_secs(11 * 60));
        assert_eq!(h.detector.status(&h.id).status_text, "");

        for _ in 0..3 {
            h.crash_after(Duration::from_secs(20)).await;
        }
        h.observe(InstanceState::Starting).await;
        assert_eq!(h.detector.status(&h.id).status_text, "(CRASH LOOP!)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_planned_restart_not_classified() {
        let h = Harness::new();
        h.observe(InstanceState::Running).await;
        h.detector.begin_planned_restart(&h.id);

        h.clock.advance(Duration::from_secs(10));
        assert!(h.observe(InstanceState::Offline).await.is_empty());
        h.observe(InstanceState::Starting).await;
        h.observe(InstanceState::Running).await;
        h.detector.end_planned_restart(&h.id);

        assert!(h.detector.crash_history(&h.id).is_empty());
        // Transitions are still recorded.
        assert_eq!(h.store.transitions().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_is_logged_only() {
        let h = Harness::new();
        h.store.fail_writes(true);
        let events = h.crash_after(Duration::from_secs(5)).await;
        assert_eq!(events.len(), 1);
        assert!(h.store.crash_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_clears_instance() {
        let h = Harness::new();
        h.crash_after(Duration::from_secs(5)).await;
        h.detector.forget(&h.id);
        assert_eq!(h.detector.status(&h.id).current_state, InstanceState::Unknown);
        assert!(h.detector.crash_history(&h.id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_feeds_telemetry() {
        use crate::control_plane::MockControlPlane;
        use crate::telemetry::{TelemetryConfig, TelemetryMonitor};

        let h = Harness::new();
        let mock = MockControlPlane::new();
        mock.add_instance(&h.id, InstanceState::Running, Some(Duration::from_secs(5)));
        let monitor = TelemetryMonitor::new(Arc::new(mock.clone()), TelemetryConfig::default());

        let task = h.detector.follow(monitor.start(&h.id));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.detector.status(&h.id).current_state, InstanceState::Running);

        mock.set_state(&h.id, InstanceState::Offline);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let history = h.detector.crash_history(&h.id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, CrashKind::UnexpectedStop);
        task.abort();
    }
}
