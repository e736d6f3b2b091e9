//! Persistence for fleet inventory, daily reboot statistics and health history.
//!
//! The engine only talks to the [`Store`] trait. [`SqliteStore`] is the
//! durable implementation used by the daemon; [`MemoryStore`] backs tests and
//! can simulate write failures.

mod memory;
mod store;

use async_trait::async_trait;
use fleetboot_id::InstanceId;
use thiserror::Error;

use crate::model::{CrashEvent, DailyRebootStats, ManagedInstance, StateTransition};

pub use memory::MemoryStore;
pub use store::SqliteStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent store boundary.
#[async_trait]
pub trait Store: Send + Sync {
    /// Managed instances in inventory order.
    async fn get_instances(&self) -> StoreResult<Vec<ManagedInstance>>;

    async fn get_daily_stats(&self, date: &str) -> StoreResult<Option<DailyRebootStats>>;

    /// Replace the record for `date`. `record.date` must match.
    async fn put_daily_stats(&self, date: &str, record: &DailyRebootStats) -> StoreResult<()>;

    async fn append_state_transition(
        &self,
        instance_id: &InstanceId,
        record: &StateTransition,
    ) -> StoreResult<()>;

    async fn append_crash_event(
        &self,
        instance_id: &InstanceId,
        record: &CrashEvent,
    ) -> StoreResult<()>;
}

fn check_date(date: &str, record: &DailyRebootStats) -> StoreResult<()> {
    if record.date != date {
        return Err(StoreError::Invalid(format!(
            "record date {} does not match key {}",
            record.date, date
        )));
    }
    Ok(())
}
