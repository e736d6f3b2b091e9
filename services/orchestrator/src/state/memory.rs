use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fleetboot_id::InstanceId;

use super::{check_date, Store, StoreError, StoreResult};
use crate::model::{CrashEvent, DailyRebootStats, ManagedInstance, StateTransition};

#[derive(Debug, Default)]
struct Inner {
    instances: Vec<ManagedInstance>,
    stats: HashMap<String, DailyRebootStats>,
    transitions: Vec<StateTransition>,
    crashes: Vec<CrashEvent>,
    fail_reads: bool,
    fail_writes: bool,
    stats_writes: usize,
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instances(instances: Vec<ManagedInstance>) -> Self {
        let store = Self::new();
        store.lock().instances = instances;
        store
    }

    pub fn set_instances(&self, instances: Vec<ManagedInstance>) {
        self.lock().instances = instances;
    }

    /// Seed a daily record directly, bypassing failure injection.
    pub fn insert_stats(&self, record: DailyRebootStats) {
        self.lock().stats.insert(record.date.clone(), record);
    }

    pub fn stats(&self, date: &str) -> Option<DailyRebootStats> {
        self.lock().stats.get(date).cloned()
    }

    /// Number of successful `put_daily_stats` calls.
    pub fn stats_writes(&self) -> usize {
        self.lock().stats_writes
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.lock().transitions.clone()
    }

    pub fn crash_events(&self) -> Vec<CrashEvent> {
        self.lock().crashes.clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }

    fn writable(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Unavailable("simulated write failure".to_string()));
        }
        Ok(inner)
    }

    fn readable(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.fail_reads {
            return Err(StoreError::Unavailable("simulated read failure".to_string()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_instances(&self) -> StoreResult<Vec<ManagedInstance>> {
        Ok(self.readable()?.instances.clone())
    }

    async fn get_daily_stats(&self, date: &str) -> StoreResult<Option<DailyRebootStats>> {
        Ok(self.readable()?.stats.get(date).cloned())
    }

    async fn put_daily_stats(&self, date: &str, record: &DailyRebootStats) -> StoreResult<()> {
        check_date(date, record)?;
        let mut inner = self.writable()?;
        inner.stats.insert(date.to_string(), record.clone());
        inner.stats_writes += 1;
        Ok(())
    }

    async fn append_state_transition(
        &self,
        _instance_id: &InstanceId,
        record: &StateTransition,
    ) -> StoreResult<()> {
        self.writable()?.transitions.push(record.clone());
        Ok(())
    }

    async fn append_crash_event(
        &self,
        _instance_id: &InstanceId,
        record: &CrashEvent,
    ) -> StoreResult<()> {
        self.writable()?.crashes.push(record.clone());
        Ok(())
    }
}
