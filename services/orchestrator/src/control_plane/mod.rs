//! Control plane boundary.
//!
//! The control plane is the remote API that commands instance power state and
//! reports status and node inventory. This module defines the interface the
//! engine consumes plus two implementations:
//!
//! - `HttpControlPlane`: the panel HTTP API (production)
//! - `MockControlPlane`: an in-process simulation for tests and dry runs

mod http;
mod mock;

use async_trait::async_trait;
use fleetboot_id::InstanceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{InstanceStatus, WorkerNode};

pub use http::HttpControlPlane;
pub use mock::{MockCall, MockCallKind, MockControlPlane};

/// Errors returned by the control plane.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Request could not be sent or the connection dropped.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The control plane answered with a non-success status.
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The instance is unknown to the control plane.
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    /// The response body could not be interpreted.
    #[error("decode error: {0}")]
    Decode(String),

    /// The control plane is temporarily unavailable.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ControlPlaneError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Unavailable(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound(_) | Self::Decode(_) => false,
        }
    }
}

pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

/// Power signals accepted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Kill,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Kill => write!(f, "kill"),
        }
    }
}

/// Remote control plane interface.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Send a console command to an instance.
    async fn send_command(&self, instance_id: &InstanceId, command: &str)
        -> ControlPlaneResult<()>;

    /// Send a power signal to an instance.
    async fn power_action(
        &self,
        instance_id: &InstanceId,
        action: PowerAction,
    ) -> ControlPlaneResult<()>;

    /// Fetch the current status of an instance.
    async fn get_status(&self, instance_id: &InstanceId) -> ControlPlaneResult<InstanceStatus>;

    /// List the worker nodes.
    async fn list_nodes(&self) -> ControlPlaneResult<Vec<WorkerNode>>;
}
