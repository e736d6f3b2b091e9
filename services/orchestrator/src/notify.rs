//! Staff and public notifications.
//!
//! Everything in the engine notifies through [`Notifier`], which never fails.
//! [`GuardedNotifier`] adapts a fallible [`NotificationSink`] to it with
//! bounded retries and a circuit breaker:
//!
//! ```text
//! Closed --[failure_threshold consecutive failures]--> Open
//! Open --[open_duration elapsed]--> HalfOpen
//! HalfOpen --[delivery succeeds]--> Closed
//! HalfOpen --[delivery fails]--> Open
//! ```

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Who a notification is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    Staff,
    Public,
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staff => f.write_str("staff"),
            Self::Public => f.write_str("public"),
        }
    }
}

/// Infallible notification boundary.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, audience: Audience, message: &str);
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// A delivery mechanism that can fail.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, audience: Audience, message: &str) -> Result<(), NotifyError>;
}

/// Posts `{"content": message}` to a per-audience webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    staff_url: Option<String>,
    public_url: Option<String>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

impl WebhookSink {
    pub fn new(staff_url: Option<String>, public_url: Option<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            staff_url,
            public_url,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, audience: Audience, message: &str) -> Result<(), NotifyError> {
        let url = match audience {
            Audience::Staff => self.staff_url.as_deref(),
            Audience::Public => self.public_url.as_deref(),
        };
        let Some(url) = url else {
            debug!(audience = %audience, "No webhook configured, dropping notification");
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&WebhookPayload { content: message })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, audience: Audience, message: &str) -> Result<(), NotifyError> {
        info!(audience = %audience, "{message}");
        Ok(())
    }
}

/// Retry and circuit breaker settings.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Delivery attempts per notification.
    pub max_attempts: u32,
    pub retry_delay: Duration,

    /// Consecutive failed notifications that open the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed.
    pub open_duration: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// A [`Notifier`] over a fallible sink.
pub struct GuardedNotifier<S> {
    sink: S,
    config: NotifierConfig,
    inner: Mutex<BreakerInner>,
}

impl<S: NotificationSink> GuardedNotifier<S> {
    pub fn new(sink: S, config: NotifierConfig) -> Self {
        Self {
            sink,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("notifier breaker mutex poisoned")
    }

    /// Whether a delivery may be attempted, moving Open to HalfOpen when due.
    fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    debug!("Notification circuit half-open");
                }
                due
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Notification circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            warn!(
                failures = inner.consecutive_failures,
                "Notification circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

#[async_trait]
impl<S: NotificationSink> Notifier for GuardedNotifier<S> {
    async fn notify(&self, audience: Audience, message: &str) {
        if !self.allow() {
            warn!(audience = %audience, "Notification dropped, circuit open");
            return;
        }

        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.sink.deliver(audience, message).await {
                Ok(()) => {
                    self.record_success();
                    return;
                }
                Err(e) => {
                    warn!(audience = %audience, attempt, error = %e, "Notification delivery failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        self.record_failure();
    }
}

/// Collects notifications in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(Audience, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Audience, String)> {
        self.lock().clone()
    }

    pub fn messages_for(&self, audience: Audience) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(a, _)| *a == audience)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Number of messages containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lock().iter().filter(|(_, m)| m.contains(needle)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Audience, String)>> {
        self.messages.lock().expect("recording notifier mutex poisoned")
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, audience: Audience, message: &str) {
        self.lock().push((audience, message.to_string()));
    }
}
