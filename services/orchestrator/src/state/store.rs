//! SQLite-backed store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetboot_id::InstanceId;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{check_date, Store, StoreError, StoreResult};
use crate::model::{
    CrashEvent, CrashKind, DailyRebootStats, InstanceState, ManagedInstance, StateTransition,
};

/// SQLite store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS managed_instances (
                instance_id TEXT PRIMARY KEY,
                tag TEXT NOT NULL,
                name TEXT NOT NULL,
                excluded INTEGER NOT NULL DEFAULT 0,
                early_access INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS state_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                uptime_secs INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_instance
                ON state_transitions(instance_id, timestamp);

            CREATE TABLE IF NOT EXISTS crash_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_crashes_instance
                ON crash_events(instance_id, timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    /// Insert or update a managed instance. New instances go to the end of the inventory.
    pub fn upsert_instance(&self, instance: &ManagedInstance) -> StoreResult<()> {
        self.conn().execute(
            r#"
            INSERT INTO managed_instances (instance_id, tag, name, excluded, early_access, position)
            VALUES (?1, ?2, ?3, ?4, ?5,
                    (SELECT COALESCE(MAX(position), 0) + 1 FROM managed_instances))
            ON CONFLICT(instance_id) DO UPDATE SET
                tag = excluded.tag,
                name = excluded.name,
                excluded = excluded.excluded,
                early_access = excluded.early_access
            "#,
            params![
                instance.id.as_str(),
                instance.tag,
                instance.name,
                instance.excluded,
                instance.early_access,
            ],
        )?;
        Ok(())
    }

    pub fn delete_instance(&self, instance_id: &InstanceId) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM managed_instances WHERE instance_id = ?1",
            params![instance_id.as_str()],
        )?;
        Ok(())
    }

    /// State transitions for an instance, oldest first.
    pub fn list_state_transitions(
        &self,
        instance_id: &InstanceId,
    ) -> StoreResult<Vec<StateTransition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT from_state, to_state, timestamp, uptime_secs
             FROM state_transitions WHERE instance_id = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![instance_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (from, to, ts, uptime) = row?;
            out.push(StateTransition {
                instance_id: instance_id.clone(),
                from_state: InstanceState::from_wire(&from),
                to_state: InstanceState::from_wire(&to),
                timestamp: parse_timestamp(&ts)?,
                uptime_secs: uptime.map(|u| u.max(0) as u64),
            });
        }
        Ok(out)
    }

    /// Crash events for an instance, oldest first.
    pub fn list_crash_events(&self, instance_id: &InstanceId) -> StoreResult<Vec<CrashEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT kind, timestamp, metadata
             FROM crash_events WHERE instance_id = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![instance_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (kind, ts, metadata) = row?;
            let kind: CrashKind = serde_json::from_value(serde_json::Value::String(kind))?;
            out.push(CrashEvent {
                kind,
                instance_id: instance_id.clone(),
                timestamp: parse_timestamp(&ts)?,
                metadata: serde_json::from_str(&metadata)?,
            });
        }
        Ok(out)
    }
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Invalid(format!("bad timestamp {s:?}: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_instances(&self) -> StoreResult<Vec<ManagedInstance>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT instance_id, tag, name, excluded, early_access
             FROM managed_instances ORDER BY position",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, tag, name, excluded, early_access) = row?;
            let id = InstanceId::parse(&id).map_err(|e| StoreError::Invalid(e.to_string()))?;
            out.push(ManagedInstance {
                id,
                tag,
                name,
                excluded,
                early_access,
            });
        }
        Ok(out)
    }

    async fn get_daily_stats(&self, date: &str) -> StoreResult<Option<DailyRebootStats>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM daily_stats WHERE date = ?1",
                params![date],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|r| serde_json::from_str(&r).map_err(Into::into))
            .transpose()
    }

    async fn put_daily_stats(&self, date: &str, record: &DailyRebootStats) -> StoreResult<()> {
        check_date(date, record)?;
        let json = serde_json::to_string(record)?;

        self.conn().execute(
            r#"
            INSERT INTO daily_stats (date, record, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(date) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
            params![date, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn append_state_transition(
        &self,
        instance_id: &InstanceId,
        record: &StateTransition,
    ) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO state_transitions (instance_id, from_state, to_state, timestamp, uptime_secs)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                instance_id.as_str(),
                record.from_state.as_str(),
                record.to_state.as_str(),
                record.timestamp.to_rfc3339(),
                record.uptime_secs.map(|u| u as i64),
            ],
        )?;
        Ok(())
    }

    async fn append_crash_event(
        &self,
        instance_id: &InstanceId,
        record: &CrashEvent,
    ) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO crash_events (instance_id, kind, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                instance_id.as_str(),
                record.kind.as_str(),
                record.timestamp.to_rfc3339(),
                serde_json::to_string(&record.metadata)?,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn inst(id: &str) -> InstanceId {
        InstanceId::parse(id).unwrap()
    }

    fn managed(id: &str, tag: &str) -> ManagedInstance {
        ManagedInstance {
            id: inst(id),
            tag: tag.to_string(),
            name: id.to_uppercase(),
            excluded: false,
            early_access: false,
        }
    }

    #[tokio::test]
    async fn test_instances_keep_inventory_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_instance(&managed("zeta", "survival")).unwrap();
        store.upsert_instance(&managed("alpha", "creative")).unwrap();

        let mut updated = managed("zeta", "hardcore");
        updated.excluded = true;
        store.upsert_instance(&updated).unwrap();

        let instances = store.get_instances().await.unwrap();
        let ids: Vec<_> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
        assert_eq!(instances[0].tag, "hardcore");
        assert!(instances[0].excluded);

        store.delete_instance(&inst("zeta")).unwrap();
        assert_eq!(store.get_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_daily_stats_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_daily_stats("2026-10-16").await.unwrap().is_none());

        let mut stats = DailyRebootStats::new("2026-10-16");
        stats.triggered = true;
        stats.total = 4;
        store.put_daily_stats("2026-10-16", &stats).await.unwrap();

        stats.successful = 4;
        stats.completed = true;
        store.put_daily_stats("2026-10-16", &stats).await.unwrap();

        let loaded = store.get_daily_stats("2026-10-16").await.unwrap().unwrap();
        assert_eq!(loaded, stats);
    }

    #[tokio::test]
    async fn test_daily_stats_key_mismatch() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stats = DailyRebootStats::new("2026-10-15");
        let err = store
            .put_daily_stats("2026-10-16", &stats)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_history_tables() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = inst("alpha");
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 4, 0, 0).unwrap();

        store
            .append_state_transition(
                &id,
                &StateTransition {
                    instance_id: id.clone(),
                    from_state: InstanceState::Running,
                    to_state: InstanceState::Offline,
                    timestamp: at,
                    uptime_secs: Some(42),
                },
            )
            .await
            .unwrap();
        store
            .append_crash_event(
                &id,
                &CrashEvent {
                    kind: CrashKind::UnexpectedStop,
                    instance_id: id.clone(),
                    timestamp: at,
                    metadata: json!({"uptime_secs": 42}),
                },
            )
            .await
            .unwrap();

        let transitions = store.list_state_transitions(&id).unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to_state, InstanceState::Offline);
        assert_eq!(transitions[0].timestamp, at);

        let crashes = store.list_crash_events(&id).unwrap();
        assert_eq!(crashes[0].kind, CrashKind::UnexpectedStop);
        assert_eq!(crashes[0].metadata["uptime_secs"], 42);
    }

    #[tokio::test]
    async fn test_reopen_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetboot.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_instance(&managed("alpha", "survival")).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_instances().await.unwrap().len(), 1);
    }
}
