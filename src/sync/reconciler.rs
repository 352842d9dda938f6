//! Sync reconciler: diffs the registry against the last mirrored snapshot
//! and pushes the minimal set of upserts.
//!
//! Operations are independent: each gets its own retry budget and timeout,
//! and one failing row never blocks the others. Operations that exhaust
//! their retries are kept for the next cycle. Rows are never deleted.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::error::SyncError;
use crate::pipeline::state::ApplicationRegistry;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::sync::{SheetRow, SpreadsheetStore, SyncSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOpKind {
    Insert,
    Update,
}

/// One pending write to the spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOp {
    pub application_id: Uuid,
    pub kind: SyncOpKind,
    pub row: SheetRow,
    /// Cycles this operation has already been deferred.
    #[serde(default)]
    pub deferrals: u32,
}

/// Minimal operations that bring `snapshot` in line with `registry`.
pub fn diff(registry: &ApplicationRegistry, snapshot: &SyncSnapshot) -> Vec<SyncOp> {
    registry
        .iter()
        .filter_map(|record| {
            let row = SheetRow::from_record(record);
            let kind = match snapshot.get(&record.application_id) {
                None => SyncOpKind::Insert,
                Some(existing) if *existing != row => SyncOpKind::Update,
                Some(_) => return None,
            };
            Some(SyncOp {
                application_id: record.application_id,
                kind,
                row,
                deferrals: 0,
            })
        })
        .collect()
}

/// What one reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The store's snapshot could not be read; the last known one was used.
    pub snapshot_fallback: bool,
    pub planned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deferred: usize,
    /// Deferred operations dropped because their row was already in sync.
    pub superseded: usize,
}

/// Owns the last-known snapshot and the deferred-operation queue.
pub struct SyncReconciler {
    store: Arc<dyn SpreadsheetStore>,
    retry: RetryPolicy,
    timeout: Duration,
    snapshot: SyncSnapshot,
    deferred: Vec<SyncOp>,
}

impl SyncReconciler {
    pub fn new(store: Arc<dyn SpreadsheetStore>, config: &TrackerConfig) -> Self {
        Self {
            store,
            retry: config.sync_retry,
            timeout: config.sync_timeout,
            snapshot: SyncSnapshot::default(),
            deferred: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &SyncSnapshot {
        &self.snapshot
    }

    /// Operations waiting for the next cycle.
    pub fn deferred(&self) -> &[SyncOp] {
        &self.deferred
    }

    /// Restore persisted state after a restart.
    pub fn restore(&mut self, snapshot: SyncSnapshot, deferred: Vec<SyncOp>) {
        self.snapshot = snapshot;
        self.deferred = deferred;
    }

    /// Run one reconcile pass.
    pub async fn reconcile(&mut self, registry: &ApplicationRegistry) -> SyncReport {
        let mut report = SyncReport::default();

        let mut snapshot = match self.read_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    store = self.store.name(),
                    error = %e,
                    "Failed to read spreadsheet snapshot, using last known"
                );
                report.snapshot_fallback = true;
                self.snapshot.clone()
            }
        };

        let mut ops = diff(registry, &snapshot);
        let fresh_ids: BTreeSet<Uuid> = ops.iter().map(|op| op.application_id).collect();
        for previous in std::mem::take(&mut self.deferred) {
            if fresh_ids.contains(&previous.application_id) {
                // The fresh diff carries the current row; keep the deferral count.
                if let Some(op) = ops
                    .iter_mut()
                    .find(|op| op.application_id == previous.application_id)
                {
                    op.deferrals = previous.deferrals;
                }
            } else {
                debug!(application_id = %previous.application_id, "Deferred operation already in sync");
                report.superseded += 1;
            }
        }
        report.planned = ops.len();

        for mut op in ops {
            match self.execute(&op).await {
                Ok(()) => {
                    match op.kind {
                        SyncOpKind::Insert => report.inserted += 1,
                        SyncOpKind::Update => report.updated += 1,
                    }
                    snapshot.insert(op.application_id, op.row);
                }
                Err(e) => {
                    op.deferrals += 1;
                    warn!(
                        application_id = %op.application_id,
                        deferrals = op.deferrals,
                        error = %e,
                        "Sync operation failed, deferring to next cycle"
                    );
                    report.deferred += 1;
                    self.deferred.push(op);
                }
            }
        }

        self.snapshot = snapshot;

        info!(
            store = self.store.name(),
            planned = report.planned,
            inserted = report.inserted,
            updated = report.updated,
            deferred = report.deferred,
            "Sync pass complete"
        );
        report
    }

    async fn read_snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        let store = self.store.as_ref();
        let timeout = self.timeout;
        retry_with_backoff(&self.retry, SyncError::is_transient, |_| async move {
            tokio::time::timeout(timeout, store.snapshot())
                .await
                .unwrap_or(Err(SyncError::Timeout(timeout)))
        })
        .await
        .result
    }

    async fn execute(&self, op: &SyncOp) -> Result<(), SyncError> {
        let store = self.store.as_ref();
        let timeout = self.timeout;
        let outcome = retry_with_backoff(&self.retry, SyncError::is_transient, |attempt| async move {
            debug!(application_id = %op.application_id, kind = ?op.kind, attempt, "Upserting row");
            tokio::time::timeout(timeout, store.upsert(op.application_id, &op.row))
                .await
                .unwrap_or(Err(SyncError::Timeout(timeout)))
        })
        .await;
        outcome.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet as Set, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::pipeline::state::{ApplicationRecord, ApplicationStatus};
    use crate::pipeline::types::{CanonicalEvent, DedupKey, EventKind};
    use crate::sync::MemorySheetStore;

    fn record(company: &str) -> ApplicationRecord {
        let at = DateTime::parse_from_rfc3339("2025-01-06T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ApplicationRecord::new(CanonicalEvent {
            dedup_key: DedupKey::new(company, "Backend Engineer", EventKind::Applied),
            company: company.into(),
            role: "Backend Engineer".into(),
            kind: EventKind::Applied,
            occurred_at: at,
            anchored_at: at,
            confidence: 0.9,
            supporting_message_ids: Set::from(["m1".to_string()]),
            arrival: 0,
        })
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            sync_retry: RetryPolicy::immediate(2),
            sync_timeout: Duration::from_millis(200),
            ..TrackerConfig::default()
        }
    }

    /// Fails upserts for the listed companies and optionally the snapshot read.
    struct FlakyStore {
        inner: MemorySheetStore,
        failing: Mutex<HashSet<String>>,
        snapshot_fails: bool,
    }

    impl FlakyStore {
        fn new(failing: &[&str], snapshot_fails: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: MemorySheetStore::new(),
                failing: Mutex::new(failing.iter().map(|s| s.to_string()).collect()),
                snapshot_fails,
            })
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl SpreadsheetStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn upsert(&self, application_id: Uuid, fields: &SheetRow) -> Result<(), SyncError> {
            if self.failing.lock().unwrap().contains(&fields.company) {
                return Err(SyncError::Http {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.inner.upsert(application_id, fields).await
        }

        async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
            if self.snapshot_fails {
                return Err(SyncError::Transport("connection reset".into()));
            }
            self.inner.snapshot().await
        }
    }

    #[test]
    fn diff_emits_only_changes() {
        let acme = record("Acme");
        let globex = record("Globex");
        let registry = ApplicationRegistry::from_records([acme.clone(), globex.clone()]);

        let snapshot = SyncSnapshot::from_rows([(acme.application_id, SheetRow::from_record(&acme))]);
        let ops = diff(&registry, &snapshot);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].application_id, globex.application_id);
        assert_eq!(ops[0].kind, SyncOpKind::Insert);

        let mut stale = SheetRow::from_record(&acme);
        stale.status = "REJECTED".into();
        let snapshot = SyncSnapshot::from_rows([
            (acme.application_id, stale),
            (globex.application_id, SheetRow::from_record(&globex)),
        ]);
        let ops = diff(&registry, &snapshot);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, SyncOpKind::Update);
        assert_eq!(ops[0].row.status, ApplicationStatus::Applied.to_string());
    }

    #[tokio::test]
    async fn reconcile_inserts_then_is_quiet() {
        let store = Arc::new(MemorySheetStore::new());
        let mut reconciler = SyncReconciler::new(store.clone(), &config());
        let registry = ApplicationRegistry::from_records([record("Acme")]);

        let report = reconciler.reconcile(&registry).await;
        assert_eq!(report.inserted, 1);
        assert_eq!(store.rows().await.len(), 1);

        let report = reconciler.reconcile(&registry).await;
        assert_eq!(report.planned, 0);
        assert_eq!(reconciler.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn failing_operation_is_deferred_without_blocking_others() {
        let store = FlakyStore::new(&["Acme"], false);
        let mut reconciler = SyncReconciler::new(store.clone(), &config());
        let registry = ApplicationRegistry::from_records([record("Acme"), record("Globex")]);

        let report = reconciler.reconcile(&registry).await;
        assert_eq!(report.inserted, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(reconciler.deferred().len(), 1);
        assert_eq!(reconciler.deferred()[0].row.company, "Acme");
        assert_eq!(reconciler.snapshot().len(), 1);

        store.heal();
        let report = reconciler.reconcile(&registry).await;
        assert_eq!(report.inserted, 1);
        assert_eq!(report.superseded, 0);
        assert!(reconciler.deferred().is_empty());
        assert_eq!(store.inner.rows().await.len(), 2);
    }

    #[tokio::test]
    async fn deferred_operation_already_in_sync_is_dropped() {
        let store = FlakyStore::new(&["Acme", "Globex"], false);
        let mut reconciler = SyncReconciler::new(store.clone(), &config());
        let acme = record("Acme");
        let registry = ApplicationRegistry::from_records([acme.clone(), record("Globex")]);

        let report = reconciler.reconcile(&registry).await;
        assert_eq!(report.deferred, 2);

        // Acme's row lands through another writer before the next pass.
        store
            .inner
            .upsert(acme.application_id, &SheetRow::from_record(&acme))
            .await
            .unwrap();
        store.heal();

        let report = reconciler.reconcile(&registry).await;
        assert_eq!(report.planned, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.superseded, 1);
        assert!(reconciler.deferred().is_empty());
    }

    #[tokio::test]
    async fn snapshot_failure_falls_back_to_last_known() {
        let store = FlakyStore::new(&[], true);
        let mut reconciler = SyncReconciler::new(store.clone(), &config());
        let registry = ApplicationRegistry::from_records([record("Acme")]);

        let report = reconciler.reconcile(&registry).await;
        assert!(report.snapshot_fallback);
        assert_eq!(report.inserted, 1);

        let report = reconciler.reconcile(&registry).await;
        assert!(report.snapshot_fallback);
        assert_eq!(report.planned, 0);
    }

    struct HangingStore;

    #[async_trait]
    impl SpreadsheetStore for HangingStore {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn upsert(&self, _id: Uuid, _fields: &SheetRow) -> Result<(), SyncError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
            Ok(SyncSnapshot::default())
        }
    }

    #[tokio::test]
    async fn timed_out_operation_is_deferred() {
        let config = TrackerConfig {
            sync_timeout: Duration::from_millis(10),
            ..config()
        };
        let mut reconciler = SyncReconciler::new(Arc::new(HangingStore), &config);
        let registry = ApplicationRegistry::from_records([record("Acme")]);
        let report = reconciler.reconcile(&registry).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(reconciler.deferred()[0].deferrals, 1);
    }
}
