//! Aggregate fleet load (connected players) used by the reboot trigger.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("status endpoint returned {0}")]
    Status(u16),

    #[error("load unavailable")]
    Unavailable,
}

#[async_trait]
pub trait LoadProbe: Send + Sync {
    async fn current_load(&self) -> Result<u64, LoadError>;
}

/// Reads `{"players": n}` from a status endpoint.
pub struct HttpLoadProbe {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    #[serde(alias = "online_players")]
    players: u64,
}

impl HttpLoadProbe {
    pub fn new(url: impl Into<String>) -> Result<Self, LoadError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl LoadProbe for HttpLoadProbe {
    async fn current_load(&self) -> Result<u64, LoadError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Status(status.as_u16()));
        }
        let body: LoadResponse = response.json().await?;
        Ok(body.players)
    }
}

/// Fixed, settable load.
#[derive(Debug, Default)]
pub struct StaticLoad {
    players: AtomicU64,
    unavailable: AtomicBool,
}

impl StaticLoad {
    pub fn new(players: u64) -> Self {
        Self {
            players: AtomicU64::new(players),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set(&self, players: u64) {
        self.players.store(players, Ordering::SeqCst);
    }

    /// Make `current_load` fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl LoadProbe for StaticLoad {
    async fn current_load(&self) -> Result<u64, LoadError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LoadError::Unavailable);
        }
        Ok(self.players.load(Ordering::SeqCst))
    }
}
