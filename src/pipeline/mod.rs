//! Email → application pipeline.
//!
//! Every cycle flows through:
//! 1. `normalize_batch()`: raw RFC 822 → `NormalizedMessage`
//! 2. `ExtractionAdapter::extract_batch()`: AI extraction with retry and throttling
//! 3. `Deduplicator::dedup()`: collapse corroborating events
//! 4. `StateMachine::apply()`: fold events into application histories
//! 5. `SyncReconciler::reconcile()`: mirror records to the spreadsheet
//!
//! `CycleRunner` drives the stages and owns the state carried between cycles.

pub mod cycle;
pub mod dedup;
pub mod extraction;
pub mod normalizer;
pub mod state;
pub mod types;

pub use cycle::{CycleReport, CycleRunner};
pub use dedup::Deduplicator;
pub use extraction::{ExtractionAdapter, ExtractionCapability, LlmExtractor};
pub use normalizer::{normalize, normalize_batch};
pub use state::{ApplicationRecord, ApplicationRegistry, ApplicationStatus, StateMachine, derive_status};
pub use types::{CanonicalEvent, DedupKey, EventKind, ExtractedEvent, NormalizedMessage};
