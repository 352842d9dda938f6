//! Persistence layer: engine state that must survive restarts.
//!
//! The registry, orphan buffer, deferred sync queue, last mirrored snapshot
//! and carried-over messages are saved together after every cycle.

pub mod libsql_backend;
pub mod migrations;

pub use libsql_backend::LibSqlStateStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::pipeline::state::{ApplicationRecord, PendingOrphan};
use crate::pipeline::types::NormalizedMessage;
use crate::sync::{SyncOp, SyncSnapshot};

/// Everything the engine carries from one cycle to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub records: Vec<ApplicationRecord>,
    pub pending_orphans: Vec<PendingOrphan>,
    pub deferred_sync: Vec<SyncOp>,
    pub sync_snapshot: SyncSnapshot,
    /// Messages whose extraction was postponed by throttling.
    pub carried_over: Vec<NormalizedMessage>,
    pub consecutive_failed_cycles: u32,
}

/// Durable home for `EngineState`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state; empty on first run.
    async fn load(&self) -> Result<EngineState, DatabaseError>;

    /// Save atomically. Application rows are upserted, never deleted.
    async fn save(&self, state: &EngineState) -> Result<(), DatabaseError>;
}
