//! Cycle runner: one pass of normalize → extract → dedup → apply → sync.
//!
//! Cycles never overlap: `run_cycle` takes `&mut self` and the registry by
//! `&mut`, so there is exactly one writer. Cancellation is checked at every
//! stage boundary, never inside an extraction call.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::config::TrackerConfig;
use crate::error::PipelineError;
use crate::mail::RawMessage;
use crate::pipeline::dedup::Deduplicator;
use crate::pipeline::extraction::{ExtractionAdapter, ExtractionCapability};
use crate::pipeline::normalizer::normalize_batch;
use crate::pipeline::state::{ApplicationRegistry, StateMachine, StatusChange};
use crate::pipeline::types::{ExtractedEvent, NormalizedMessage};
use crate::store::EngineState;
use crate::sync::{SpreadsheetStore, SyncReconciler, SyncReport};

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub skipped: usize,
    pub normalized: usize,
    /// Messages carried in from the previous cycle.
    pub resumed: usize,
    pub extracted_events: usize,
    pub below_threshold: usize,
    pub invalid_records: usize,
    pub malformed: usize,
    pub provider_failures: usize,
    pub throttle_pauses: u32,
    /// Messages handed to the next cycle after throttling.
    pub carried_over: usize,
    pub canonical_events: usize,
    pub records_created: usize,
    pub status_changes: Vec<StatusChange>,
    pub orphans_buffered: usize,
    pub orphans_discarded: usize,
    pub sync: SyncReport,
    /// Set once extraction has failed outright for too many consecutive cycles.
    pub degraded: bool,
}

/// Drives the pipeline stages for successive polling cycles.
pub struct CycleRunner {
    config: TrackerConfig,
    adapter: ExtractionAdapter,
    dedup: Deduplicator,
    state: StateMachine,
    reconciler: SyncReconciler,
    cancel: Arc<AtomicBool>,
    carried_over: Vec<NormalizedMessage>,
    consecutive_failed_cycles: u32,
}

impl CycleRunner {
    pub fn new(
        config: TrackerConfig,
        capability: Arc<dyn ExtractionCapability>,
        store: Arc<dyn SpreadsheetStore>,
    ) -> Self {
        Self {
            adapter: ExtractionAdapter::new(capability, &config),
            dedup: Deduplicator::new(config.merge_window),
            state: StateMachine::new(config.merge_window, config.orphan_grace_cycles),
            reconciler: SyncReconciler::new(store, &config),
            cancel: Arc::new(AtomicBool::new(false)),
            carried_over: Vec::new(),
            consecutive_failed_cycles: 0,
            config,
        }
    }

    /// Flag that cancels the current cycle at its next stage boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Messages waiting for the next cycle.
    pub fn carried_over(&self) -> &[NormalizedMessage] {
        &self.carried_over
    }

    /// Restore persisted state; returns the registry to drive cycles with.
    pub fn restore(&mut self, state: EngineState) -> ApplicationRegistry {
        self.state.restore_pending(state.pending_orphans);
        self.reconciler
            .restore(state.sync_snapshot, state.deferred_sync);
        self.carried_over = state.carried_over;
        self.consecutive_failed_cycles = state.consecutive_failed_cycles;
        ApplicationRegistry::from_records(state.records)
    }

    /// Capture everything needed to resume after a restart.
    pub fn export(&self, registry: &ApplicationRegistry) -> EngineState {
        EngineState {
            records: registry.iter().cloned().collect(),
            pending_orphans: self.state.pending().to_vec(),
            deferred_sync: self.reconciler.deferred().to_vec(),
            sync_snapshot: self.reconciler.snapshot().clone(),
            carried_over: self.carried_over.clone(),
            consecutive_failed_cycles: self.consecutive_failed_cycles,
        }
    }

    fn check_cancel(&self, stage: &'static str) -> Result<(), PipelineError> {
        if self.cancel.load(Ordering::SeqCst) {
            warn!(stage, "Cycle cancelled");
            return Err(PipelineError::Cancelled { stage });
        }
        Ok(())
    }

    /// Run one cycle over a freshly fetched batch.
    ///
    /// On cancellation before events are applied, every message of the
    /// cycle is kept for the next one.
    pub async fn run_cycle(
        &mut self,
        registry: &mut ApplicationRegistry,
        raw: &[RawMessage],
    ) -> Result<CycleReport, PipelineError> {
        let mut report = CycleReport {
            fetched: raw.len(),
            resumed: self.carried_over.len(),
            ..CycleReport::default()
        };

        self.check_cancel("normalize")?;
        let (normalized, skipped) = normalize_batch(raw);
        report.normalized = normalized.len();
        report.skipped = skipped.len();

        let mut seen = HashSet::new();
        let messages: Vec<NormalizedMessage> = std::mem::take(&mut self.carried_over)
            .into_iter()
            .chain(normalized)
            .filter(|m| seen.insert(m.id.clone()))
            .collect();

        if let Err(e) = self.check_cancel("extract") {
            self.carried_over = messages;
            return Err(e);
        }
        let events = match self.extract_all(messages.clone(), &mut report).await {
            Ok(events) => events,
            Err(e) => {
                self.carried_over = messages;
                return Err(e);
            }
        };

        if let Err(e) = self.check_cancel("dedup") {
            self.carried_over = messages;
            return Err(e);
        }
        let canonical = self.dedup.dedup(&events);
        report.canonical_events = canonical.len();

        if let Err(e) = self.check_cancel("apply") {
            self.carried_over = messages;
            return Err(e);
        }
        let applied = self.state.apply(registry, canonical);
        report.records_created = applied.created.len();
        report.status_changes = applied.status_changes;
        report.orphans_buffered = applied.orphans_buffered;
        report.orphans_discarded = applied.orphans_discarded;

        self.check_cancel("sync")?;
        report.sync = self.reconciler.reconcile(registry).await;

        info!(
            fetched = report.fetched,
            skipped = report.skipped,
            events = report.extracted_events,
            canonical = report.canonical_events,
            created = report.records_created,
            status_changes = report.status_changes.len(),
            carried_over = report.carried_over,
            synced = report.sync.inserted + report.sync.updated,
            deferred = report.sync.deferred,
            degraded = report.degraded,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Extract every message, pausing on throttle up to the configured limit.
    ///
    /// Events already extracted are kept across pauses; whatever is still
    /// unprocessed after the last allowed pause is carried to the next cycle.
    async fn extract_all(
        &mut self,
        messages: Vec<NormalizedMessage>,
        report: &mut CycleReport,
    ) -> Result<Vec<ExtractedEvent>, PipelineError> {
        let mut events = Vec::new();
        let mut pending = messages;
        let mut completed = 0usize;

        while !pending.is_empty() {
            let batch = self.adapter.extract_batch(pending).await;
            events.extend(batch.events);
            completed += batch.completed.len();
            report.extracted_events += batch.stats.events;
            report.below_threshold += batch.stats.below_threshold;
            report.invalid_records += batch.stats.invalid;
            report.malformed += batch.stats.malformed;
            report.provider_failures += batch.stats.provider_failures;
            pending = batch.remaining;

            let Some(retry_after) = batch.throttled else {
                break;
            };
            if report.throttle_pauses >= self.config.max_throttle_pauses {
                warn!(
                    remaining = pending.len(),
                    "Throttle pause limit reached, carrying messages to next cycle"
                );
                break;
            }

            let pause = retry_after.unwrap_or(self.config.throttle_pause);
            report.throttle_pauses += 1;
            info!(
                pause_secs = pause.as_secs_f64(),
                remaining = pending.len(),
                "Extraction throttled, pausing cycle"
            );
            tokio::time::sleep(pause).await;
            self.check_cancel("extract")?;
        }

        report.carried_over = pending.len();
        self.carried_over = pending;

        self.track_degraded(completed, report);
        Ok(events)
    }

    fn track_degraded(&mut self, completed: usize, report: &mut CycleReport) {
        if completed == 0 {
            report.degraded = self.is_degraded();
            return;
        }
        if report.provider_failures == completed {
            self.consecutive_failed_cycles += 1;
        } else {
            self.consecutive_failed_cycles = 0;
        }
        report.degraded = self.is_degraded();
        if report.degraded {
            error!(
                consecutive_failed_cycles = self.consecutive_failed_cycles,
                "Extraction capability unreachable across consecutive cycles, entering degraded mode"
            );
        }
    }

    fn is_degraded(&self) -> bool {
        self.consecutive_failed_cycles >= self.config.degraded_after_cycles
    }
}
