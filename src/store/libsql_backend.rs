//! libSQL backend: async `StateStore` implementation.
//!
//! Supports local file and in-memory databases. Structured values are
//! stored as JSON text columns; a few fields are duplicated into plain
//! columns for ad-hoc inspection with the sqlite shell.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::state::{ApplicationRecord, PendingOrphan};
use crate::pipeline::types::{CanonicalEvent, NormalizedMessage};
use crate::store::{EngineState, StateStore, migrations};
use crate::sync::{SyncOp, SyncSnapshot};

const META_SYNC_SNAPSHOT: &str = "sync_snapshot";
const META_FAILED_CYCLES: &str = "consecutive_failed_cycles";

/// libSQL state store.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlStateStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStateStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "State database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn load_json_column<T: DeserializeOwned>(
        &self,
        sql: &str,
        what: &str,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to load {what}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read {what}: {e}")))?
        {
            let json: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("Failed to read {what}: {e}")))?;
            out.push(from_json(&json)?);
        }
        Ok(out)
    }

    async fn load_pending_orphans(&self) -> Result<Vec<PendingOrphan>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT event, cycles_waited FROM pending_orphans ORDER BY position",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to load orphans: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read orphans: {e}")))?
        {
            let json: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("Failed to read orphan event: {e}")))?;
            let cycles_waited: i64 = row.get(1).unwrap_or(0);
            out.push(PendingOrphan {
                event: from_json::<CanonicalEvent>(&json)?,
                cycles_waited: u32::try_from(cycles_waited).unwrap_or(0),
            });
        }
        Ok(out)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT value FROM engine_meta WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read meta {key}: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read meta {key}: {e}")))?
        {
            Some(row) => Ok(row.get::<String>(0).ok()),
            None => Ok(None),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(json: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(json).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn query_err(what: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("Failed to save {what}: {e}"))
}

#[async_trait]
impl StateStore for LibSqlStateStore {
    async fn load(&self) -> Result<EngineState, DatabaseError> {
        let records: Vec<ApplicationRecord> = self
            .load_json_column("SELECT record FROM applications ORDER BY id", "applications")
            .await?;
        let deferred_sync: Vec<SyncOp> = self
            .load_json_column(
                "SELECT op FROM deferred_sync ORDER BY application_id",
                "deferred sync operations",
            )
            .await?;
        let carried_over: Vec<NormalizedMessage> = self
            .load_json_column(
                "SELECT message FROM carried_messages ORDER BY position",
                "carried-over messages",
            )
            .await?;
        let pending_orphans = self.load_pending_orphans().await?;

        let sync_snapshot = match self.get_meta(META_SYNC_SNAPSHOT).await? {
            Some(json) => from_json::<SyncSnapshot>(&json)?,
            None => SyncSnapshot::default(),
        };
        let consecutive_failed_cycles = self
            .get_meta(META_FAILED_CYCLES)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        debug!(
            records = records.len(),
            orphans = pending_orphans.len(),
            deferred = deferred_sync.len(),
            carried_over = carried_over.len(),
            "Engine state loaded"
        );

        Ok(EngineState {
            records,
            pending_orphans,
            deferred_sync,
            sync_snapshot,
            carried_over,
            consecutive_failed_cycles,
        })
    }

    async fn save(&self, state: &EngineState) -> Result<(), DatabaseError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to begin transaction: {e}")))?;

        for record in &state.records {
            tx.execute(
                "INSERT INTO applications (id, company, role, status, last_updated_at, record, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                    company = excluded.company,
                    role = excluded.role,
                    status = excluded.status,
                    last_updated_at = excluded.last_updated_at,
                    record = excluded.record,
                    saved_at = excluded.saved_at",
                params![
                    record.application_id.to_string(),
                    record.company.as_str(),
                    record.role.as_str(),
                    record.status().as_str(),
                    record
                        .last_updated_at()
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                    to_json(record)?,
                ],
            )
            .await
            .map_err(query_err("application"))?;
        }

        tx.execute("DELETE FROM pending_orphans", ())
            .await
            .map_err(query_err("orphans"))?;
        for (position, orphan) in state.pending_orphans.iter().enumerate() {
            tx.execute(
                "INSERT INTO pending_orphans (position, event, cycles_waited) VALUES (?1, ?2, ?3)",
                params![
                    position as i64,
                    to_json(&orphan.event)?,
                    i64::from(orphan.cycles_waited)
                ],
            )
            .await
            .map_err(query_err("orphan"))?;
        }

        tx.execute("DELETE FROM deferred_sync", ())
            .await
            .map_err(query_err("deferred sync operations"))?;
        for op in &state.deferred_sync {
            tx.execute(
                "INSERT OR REPLACE INTO deferred_sync (application_id, op) VALUES (?1, ?2)",
                params![op.application_id.to_string(), to_json(op)?],
            )
            .await
            .map_err(query_err("deferred sync operation"))?;
        }

        tx.execute("DELETE FROM carried_messages", ())
            .await
            .map_err(query_err("carried-over messages"))?;
        for (position, message) in state.carried_over.iter().enumerate() {
            tx.execute(
                "INSERT INTO carried_messages (position, message_id, message) VALUES (?1, ?2, ?3)",
                params![position as i64, message.id.as_str(), to_json(message)?],
            )
            .await
            .map_err(query_err("carried-over message"))?;
        }

        for (key, value) in [
            (META_SYNC_SNAPSHOT, to_json(&state.sync_snapshot)?),
            (META_FAILED_CYCLES, state.consecutive_failed_cycles.to_string()),
        ] {
            tx.execute(
                "INSERT INTO engine_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .await
            .map_err(query_err("engine metadata"))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to commit state: {e}")))?;

        debug!(records = state.records.len(), "Engine state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::{DateTime, Utc};

    use crate::pipeline::types::{DedupKey, EventKind};
    use crate::sync::{SheetRow, SyncOpKind};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn event(kind: EventKind, id: &str) -> CanonicalEvent {
        CanonicalEvent {
            dedup_key: DedupKey::new("Acme", "Backend Engineer", kind),
            company: "Acme".into(),
            role: "Backend Engineer".into(),
            kind,
            occurred_at: at("2025-01-06T09:00:00Z"),
            anchored_at: at("2025-01-06T09:00:00Z"),
            confidence: 0.9,
            supporting_message_ids: BTreeSet::from([id.to_string()]),
            arrival: 0,
        }
    }

    fn sample_state() -> EngineState {
        let record = ApplicationRecord::new(event(EventKind::Applied, "m1"));
        let row = SheetRow::from_record(&record);
        EngineState {
            deferred_sync: vec![SyncOp {
                application_id: record.application_id,
                kind: SyncOpKind::Insert,
                row: row.clone(),
                deferrals: 2,
            }],
            sync_snapshot: SyncSnapshot::from_rows([(record.application_id, row)]),
            records: vec![record],
            pending_orphans: vec![PendingOrphan {
                event: event(EventKind::Interview, "m2"),
                cycles_waited: 0,
            }],
            carried_over: vec![NormalizedMessage {
                id: "m3".into(),
                sender: "hr@globex.com".into(),
                subject: "Interview".into(),
                body: "Let's talk".into(),
                received_at: at("2025-01-07T10:00:00Z"),
            }],
            consecutive_failed_cycles: 1,
        }
    }

    #[tokio::test]
    async fn empty_database_loads_default_state() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
        assert_eq!(store.load().await.unwrap(), EngineState::default());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
        let state = sample_state();
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn save_replaces_queues_but_keeps_applications() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
        store.save(&sample_state()).await.unwrap();

        let cleared = EngineState::default();
        store.save(&cleared).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert!(loaded.pending_orphans.is_empty());
        assert!(loaded.deferred_sync.is_empty());
        assert!(loaded.carried_over.is_empty());
        assert_eq!(loaded.consecutive_failed_cycles, 0);
    }

    #[tokio::test]
    async fn state_survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        {
            let store = LibSqlStateStore::new_local(&path).await.unwrap();
            store.save(&sample_state()).await.unwrap();
        }

        let reopened = LibSqlStateStore::new_local(&path).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), sample_state());
    }
}
