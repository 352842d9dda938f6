//! Application state machine: folds canonical events into per-application records.
//!
//! Status is never stored: it is recomputed from `history` by `derive_status`,
//! a pure reducer over the event log. The registry is owned by the caller and
//! passed in by `&mut`; this module holds only the orphan buffer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::types::{CanonicalEvent, DedupKey, EventKind};

// ── Status ──────────────────────────────────────────────────────────

/// Lifecycle status of one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Applied,
    InReview,
    Interviewing,
    Offered,
    Rejected,
    Withdrawn,
}

impl ApplicationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Offered | Self::Rejected | Self::Withdrawn)
    }

    /// Position along the non-terminal progression.
    fn progress(self) -> u8 {
        match self {
            Self::Applied => 0,
            Self::InReview => 1,
            Self::Interviewing => 2,
            Self::Offered | Self::Rejected | Self::Withdrawn => 3,
        }
    }

    /// Status an event of `kind` moves towards. `UNKNOWN` has none.
    fn target_of(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::Applied => Some(Self::Applied),
            EventKind::Ack => Some(Self::InReview),
            EventKind::Interview => Some(Self::Interviewing),
            EventKind::Offer => Some(Self::Offered),
            EventKind::Rejected => Some(Self::Rejected),
            EventKind::Withdrawn => Some(Self::Withdrawn),
            EventKind::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "APPLIED",
            Self::InReview => "IN_REVIEW",
            Self::Interviewing => "INTERVIEWING",
            Self::Offered => "OFFERED",
            Self::Rejected => "REJECTED",
            Self::Withdrawn => "WITHDRAWN",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step of the reducer.
///
/// Non-terminal states only move forward; terminal kinds are accepted from any
/// non-terminal state; a terminal state is only left for `REJECTED` over `OFFERED`.
fn transition(current: Option<ApplicationStatus>, kind: EventKind) -> Option<ApplicationStatus> {
    let Some(target) = ApplicationStatus::target_of(kind) else {
        return current;
    };
    let Some(current) = current else {
        return Some(target);
    };
    let next = if current.is_terminal() {
        match (current, target) {
            (ApplicationStatus::Offered, ApplicationStatus::Rejected) => target,
            _ => current,
        }
    } else if target.progress() > current.progress() {
        target
    } else {
        current
    };
    Some(next)
}

/// Derive status from a history.
///
/// Entries are folded in arrival order. An entry only affects status when
/// its anchor is at least that of every entry that arrived before it, so
/// late-arriving older events are recorded without rewriting the present.
/// Anchors are fixed once an entry is in history, which keeps merged
/// duplicates from shifting an entry past later ones. Returns `None` for an
/// empty history.
pub fn derive_status(history: &[CanonicalEvent]) -> Option<ApplicationStatus> {
    let mut by_arrival: Vec<&CanonicalEvent> = history.iter().collect();
    by_arrival.sort_by_key(|e| e.arrival);

    let mut status = None;
    let mut latest: Option<DateTime<Utc>> = None;
    for event in by_arrival {
        let is_newest = latest.is_none_or(|l| event.anchored_at >= l);
        if is_newest {
            latest = Some(event.anchored_at);
            status = transition(status, event.kind);
        }
    }
    status
}

/// Stable id for a (company, role) pair, from the normalized key.
pub fn application_id(key: &DedupKey) -> Uuid {
    let (company, role) = key.application_key();
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("job-tracker:{company}\u{1f}{role}").as_bytes(),
    )
}

// ── Record ──────────────────────────────────────────────────────────

/// What happened to an event inserted into a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// Corroborated an existing history entry.
    Merged,
    /// Added a new history entry.
    Appended,
}

/// Lifecycle record for one (company, role) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub application_id: Uuid,
    /// Display company name, from the event that created the record.
    pub company: String,
    /// Display role, from the event that created the record.
    pub role: String,
    history: Vec<CanonicalEvent>,
}

impl ApplicationRecord {
    /// Start a record from its first `APPLIED` event.
    pub fn new(mut event: CanonicalEvent) -> Self {
        event.arrival = 0;
        Self {
            application_id: application_id(&event.dedup_key),
            company: event.company.clone(),
            role: event.role.clone(),
            history: vec![event],
        }
    }

    /// Chronological event log.
    pub fn history(&self) -> &[CanonicalEvent] {
        &self.history
    }

    pub fn status(&self) -> ApplicationStatus {
        derive_status(&self.history).unwrap_or(ApplicationStatus::Applied)
    }

    /// `occurred_at` of the chronologically latest history entry.
    pub fn last_updated_at(&self) -> DateTime<Utc> {
        self.history
            .last()
            .map(|e| e.occurred_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Insert an event at its chronological position, or merge it into an
    /// existing entry it corroborates.
    pub fn insert(&mut self, mut event: CanonicalEvent, window: chrono::Duration) -> Insertion {
        let existing = self
            .history
            .iter_mut()
            .find(|entry| entry.corroborates(&event, window));
        if let Some(entry) = existing {
            // The anchor is fixed once in history; `derive_status` orders by it.
            let anchored_at = entry.anchored_at;
            entry.absorb(&event);
            entry.anchored_at = anchored_at;
            // Absorbing may move the entry in time.
            self.history.sort_by_key(|e| (e.occurred_at, e.arrival));
            return Insertion::Merged;
        }

        event.arrival = self.history.iter().map(|e| e.arrival).max().map_or(0, |a| a + 1);
        let position = self
            .history
            .partition_point(|e| e.occurred_at <= event.occurred_at);
        self.history.insert(position, event);
        Insertion::Appended
    }

    /// One line per history entry, for the spreadsheet mirror.
    pub fn history_summary(&self) -> String {
        self.history
            .iter()
            .map(|e| format!("{} {}", e.occurred_at.format("%Y-%m-%d"), e.kind))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Single-owner keyed store of application records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRegistry {
    records: BTreeMap<Uuid, ApplicationRecord>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ApplicationRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.application_id, r))
                .collect(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&ApplicationRecord> {
        self.records.get(id)
    }

    /// Look up by display or normalized (company, role).
    pub fn find(&self, company: &str, role: &str) -> Option<&ApplicationRecord> {
        self.records
            .get(&application_id(&DedupKey::new(company, role, EventKind::Applied)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApplicationRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn get_mut(&mut self, id: &Uuid) -> Option<&mut ApplicationRecord> {
        self.records.get_mut(id)
    }

    fn insert(&mut self, record: ApplicationRecord) {
        self.records.insert(record.application_id, record);
    }
}

// ── State machine ───────────────────────────────────────────────────

/// A non-`APPLIED` event waiting for its application to appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrphan {
    pub event: CanonicalEvent,
    /// Cycles already waited after the one it arrived in.
    pub cycles_waited: u32,
}

/// A status change caused by applying events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub application_id: Uuid,
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
}

/// What one `apply` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub appended: usize,
    pub merged: usize,
    pub created: Vec<Uuid>,
    pub status_changes: Vec<StatusChange>,
    pub orphans_resolved: usize,
    pub orphans_buffered: usize,
    pub orphans_discarded: usize,
}

enum Applied {
    Created(Uuid),
    Inserted {
        insertion: Insertion,
        change: Option<StatusChange>,
    },
}

/// Applies canonical events to a registry and buffers orphans.
#[derive(Debug, Clone)]
pub struct StateMachine {
    window: chrono::Duration,
    orphan_grace_cycles: u32,
    pending: Vec<PendingOrphan>,
}

impl StateMachine {
    pub fn new(window: chrono::Duration, orphan_grace_cycles: u32) -> Self {
        Self {
            window,
            orphan_grace_cycles,
            pending: Vec::new(),
        }
    }

    /// Orphans currently waiting.
    pub fn pending(&self) -> &[PendingOrphan] {
        &self.pending
    }

    /// Restore a persisted orphan buffer.
    pub fn restore_pending(&mut self, pending: Vec<PendingOrphan>) {
        self.pending = pending;
    }

    /// Apply one cycle's canonical events, together with buffered orphans.
    ///
    /// Everything is applied in anchor order. Events that find no
    /// record get a second pass, since their `APPLIED` event may sort
    /// after them in the same batch.
    pub fn apply(
        &mut self,
        registry: &mut ApplicationRegistry,
        events: Vec<CanonicalEvent>,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();

        let mut batch: Vec<(CanonicalEvent, Option<u32>)> = self
            .pending
            .drain(..)
            .map(|p| (p.event, Some(p.cycles_waited)))
            .chain(events.into_iter().map(|e| (e, None)))
            .collect();
        batch.sort_by(|(a, _), (b, _)| {
            a.anchored_at
                .cmp(&b.anchored_at)
                .then_with(|| a.dedup_key.cmp(&b.dedup_key))
        });

        let mut unmatched = Vec::new();
        for (event, waited) in batch {
            match self.apply_one(registry, event) {
                Ok(applied) => Self::record(&mut report, applied, waited.is_some()),
                Err(event) => unmatched.push((event, waited)),
            }
        }

        let mut still_unmatched = Vec::new();
        for (event, waited) in unmatched {
            match self.apply_one(registry, event) {
                Ok(applied) => Self::record(&mut report, applied, waited.is_some()),
                Err(event) => still_unmatched.push((event, waited)),
            }
        }

        for (event, waited) in still_unmatched {
            self.hold_or_discard(event, waited, &mut report);
        }

        report
    }

    fn apply_one(
        &self,
        registry: &mut ApplicationRegistry,
        event: CanonicalEvent,
    ) -> Result<Applied, CanonicalEvent> {
        let id = application_id(&event.dedup_key);
        if let Some(record) = registry.get_mut(&id) {
            let before = record.status();
            let kind = event.kind;
            let insertion = record.insert(event, self.window);
            let after = record.status();
            debug!(application_id = %id, %kind, ?insertion, "Event applied");
            let change = (before != after).then(|| {
                info!(
                    application_id = %id,
                    company = %record.company,
                    role = %record.role,
                    from = %before,
                    to = %after,
                    "Application status changed"
                );
                StatusChange {
                    application_id: id,
                    from: before,
                    to: after,
                }
            });
            return Ok(Applied::Inserted { insertion, change });
        }

        if event.kind == EventKind::Applied {
            let record = ApplicationRecord::new(event);
            info!(
                application_id = %id,
                company = %record.company,
                role = %record.role,
                "New application tracked"
            );
            registry.insert(record);
            return Ok(Applied::Created(id));
        }

        Err(event)
    }

    fn record(report: &mut ApplyReport, applied: Applied, was_orphan: bool) {
        if was_orphan {
            report.orphans_resolved += 1;
        }
        match applied {
            Applied::Created(id) => report.created.push(id),
            Applied::Inserted { insertion, change } => {
                match insertion {
                    Insertion::Merged => report.merged += 1,
                    Insertion::Appended => report.appended += 1,
                }
                report.status_changes.extend(change);
            }
        }
    }

    fn hold_or_discard(
        &mut self,
        event: CanonicalEvent,
        waited: Option<u32>,
        report: &mut ApplyReport,
    ) {
        let cycles_waited = waited.map_or(0, |w| w + 1);
        let expired = match waited {
            Some(_) => cycles_waited >= self.orphan_grace_cycles,
            None => self.orphan_grace_cycles == 0,
        };

        if expired {
            warn!(
                company = %event.company,
                role = %event.role,
                kind = %event.kind,
                messages = ?event.supporting_message_ids,
                "Discarding orphan event: no matching application appeared"
            );
            report.orphans_discarded += 1;
            return;
        }

        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|p| p.event.corroborates(&event, self.window))
        {
            existing.event.absorb(&event);
            existing.cycles_waited = existing.cycles_waited.max(cycles_waited);
            return;
        }

        if waited.is_none() {
            warn!(
                company = %event.company,
                role = %event.role,
                kind = %event.kind,
                "Orphan event: no matching application, holding for next cycle"
            );
            report.orphans_buffered += 1;
        }
        self.pending.push(PendingOrphan {
            event,
            cycles_waited,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn t(days: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-06T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::days(days)
    }

    fn canonical(id: &str, kind: EventKind, days: i64) -> CanonicalEvent {
        CanonicalEvent {
            dedup_key: DedupKey::new("Acme", "Backend Engineer", kind),
            company: "Acme".into(),
            role: "Backend Engineer".into(),
            kind,
            occurred_at: t(days),
            anchored_at: t(days),
            confidence: 0.9,
            supporting_message_ids: BTreeSet::from([id.to_string()]),
            arrival: 0,
        }
    }

    fn machine() -> StateMachine {
        StateMachine::new(Duration::hours(48), 1)
    }

    fn only_record(registry: &ApplicationRegistry) -> &ApplicationRecord {
        assert_eq!(registry.len(), 1);
        registry.iter().next().unwrap()
    }

    // ── Reducer ─────────────────────────────────────────────────────

    fn history(events: &[(EventKind, i64)]) -> Vec<CanonicalEvent> {
        events
            .iter()
            .enumerate()
            .map(|(i, (kind, day))| {
                let mut e = canonical(&format!("m{i}"), *kind, *day);
                e.arrival = i as u64;
                e
            })
            .collect()
    }

    #[test]
    fn reducer_follows_progression() {
        use EventKind::*;
        assert_eq!(derive_status(&history(&[(Applied, 0)])), Some(ApplicationStatus::Applied));
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Ack, 1)])),
            Some(ApplicationStatus::InReview)
        );
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Ack, 1), (Interview, 3)])),
            Some(ApplicationStatus::Interviewing)
        );
        assert_eq!(derive_status(&[]), None);
    }

    #[test]
    fn reducer_never_regresses_non_terminal() {
        use EventKind::*;
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Interview, 2), (Ack, 3)])),
            Some(ApplicationStatus::Interviewing)
        );
    }

    #[test]
    fn rejected_overrides_offer_but_not_the_reverse() {
        use EventKind::*;
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Offer, 5), (Rejected, 15)])),
            Some(ApplicationStatus::Rejected)
        );
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Rejected, 5), (Offer, 15)])),
            Some(ApplicationStatus::Rejected)
        );
    }

    #[test]
    fn terminal_states_ignore_lower_rank_events() {
        use EventKind::*;
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Rejected, 5), (Interview, 9)])),
            Some(ApplicationStatus::Rejected)
        );
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Offer, 5), (Withdrawn, 9)])),
            Some(ApplicationStatus::Offered)
        );
    }

    #[test]
    fn withdrawn_reachable_from_non_terminal() {
        use EventKind::*;
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Interview, 3), (Withdrawn, 4)])),
            Some(ApplicationStatus::Withdrawn)
        );
    }

    #[test]
    fn unknown_events_do_not_change_status() {
        use EventKind::*;
        assert_eq!(
            derive_status(&history(&[(Applied, 0), (Unknown, 1)])),
            Some(ApplicationStatus::Applied)
        );
    }

    #[test]
    fn late_arriving_older_event_does_not_change_status() {
        let mut applied = canonical("m1", EventKind::Applied, 0);
        applied.arrival = 0;
        let mut ack = canonical("m2", EventKind::Ack, 5);
        ack.arrival = 1;
        let mut interview = canonical("m3", EventKind::Interview, 3);
        interview.arrival = 2;
        let history = vec![applied, interview, ack];
        assert_eq!(derive_status(&history), Some(ApplicationStatus::InReview));
    }

    #[test]
    fn application_id_is_stable_across_spellings() {
        let a = application_id(&DedupKey::new("Acme, Inc.", "Backend Engineer", EventKind::Applied));
        let b = application_id(&DedupKey::new("ACME", "backend engineer", EventKind::Offer));
        assert_eq!(a, b);
        let c = application_id(&DedupKey::new("Acme", "Frontend Engineer", EventKind::Applied));
        assert_ne!(a, c);
    }

    // ── Record ──────────────────────────────────────────────────────

    #[test]
    fn record_keeps_history_sorted() {
        let mut record = ApplicationRecord::new(canonical("m1", EventKind::Applied, 0));
        record.insert(canonical("m3", EventKind::Interview, 6), Duration::hours(48));
        record.insert(canonical("m2", EventKind::Ack, 2), Duration::hours(48));
        let kinds: Vec<_> = record.history().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Applied, EventKind::Ack, EventKind::Interview]);
        assert_eq!(record.last_updated_at(), t(6));
        assert_eq!(record.status(), ApplicationStatus::Interviewing);
        assert_eq!(
            record.history_summary(),
            "2025-01-06 APPLIED; 2025-01-08 ACK; 2025-01-12 INTERVIEW"
        );
    }

    #[test]
    fn record_merges_matching_event() {
        let mut record = ApplicationRecord::new(canonical("m1", EventKind::Applied, 0));
        let insertion = record.insert(canonical("m2", EventKind::Applied, 1), Duration::hours(48));
        assert_eq!(insertion, Insertion::Merged);
        assert_eq!(record.history().len(), 1);
        assert_eq!(record.history()[0].supporting_message_ids.len(), 2);
    }

    #[test]
    fn merged_forward_keeps_entry_anchor() {
        let mut record = ApplicationRecord::new(canonical("m1", EventKind::Applied, 0));
        record.insert(canonical("m2", EventKind::Interview, 1), Duration::hours(48));
        assert_eq!(record.status(), ApplicationStatus::Interviewing);

        // A stronger copy of the confirmation, dated after the interview.
        let mut forward = canonical("m3", EventKind::Applied, 0);
        forward.occurred_at = t(0) + Duration::hours(30);
        forward.anchored_at = forward.occurred_at;
        forward.confidence = 0.95;
        assert_eq!(record.insert(forward, Duration::hours(48)), Insertion::Merged);

        let applied = &record.history()[1];
        assert_eq!(applied.kind, EventKind::Applied);
        assert_eq!(applied.occurred_at, t(0) + Duration::hours(30));
        assert_eq!(applied.anchored_at, t(0));
        assert_eq!(record.status(), ApplicationStatus::Interviewing);
    }

    #[test]
    fn events_kept_apart_by_dedup_stay_apart_in_history() {
        let mut first = canonical("m0", EventKind::Applied, 0);
        first.occurred_at = t(0) + Duration::hours(40);
        first.supporting_message_ids.insert("m40".into());
        let mut second = canonical("m50", EventKind::Applied, 0);
        second.occurred_at = t(0) + Duration::hours(50);
        second.anchored_at = second.occurred_at;

        let mut registry = ApplicationRegistry::new();
        machine().apply(&mut registry, vec![first, second]);
        let record = only_record(&registry);
        assert_eq!(record.history().len(), 2);
        assert_eq!(record.history()[0].supporting_message_ids.len(), 2);
    }

    // ── State machine ───────────────────────────────────────────────

    #[test]
    fn applied_event_creates_record() {
        let mut registry = ApplicationRegistry::new();
        let report = machine().apply(&mut registry, vec![canonical("m1", EventKind::Applied, 0)]);
        assert_eq!(report.created.len(), 1);
        let record = only_record(&registry);
        assert_eq!(record.status(), ApplicationStatus::Applied);
        assert_eq!(record.company, "Acme");
        assert!(registry.find("ACME inc", "backend engineer").is_some());
    }

    #[test]
    fn reapplying_the_same_events_is_idempotent() {
        let mut registry = ApplicationRegistry::new();
        let mut sm = machine();
        let events = vec![
            canonical("m1", EventKind::Applied, 0),
            canonical("m2", EventKind::Interview, 3),
        ];
        sm.apply(&mut registry, events.clone());
        let first = registry.clone();
        let report = sm.apply(&mut registry, events);
        assert_eq!(registry, first);
        assert_eq!(report.merged, 2);
        assert!(report.status_changes.is_empty());
    }

    #[test]
    fn batch_order_does_not_matter() {
        let mut a = ApplicationRegistry::new();
        let mut b = ApplicationRegistry::new();
        let events = vec![
            canonical("m1", EventKind::Applied, 0),
            canonical("m2", EventKind::Ack, 1),
            canonical("m3", EventKind::Interview, 4),
        ];
        machine().apply(&mut a, events.clone());
        machine().apply(&mut b, events.into_iter().rev().collect());
        assert_eq!(a, b);
        assert_eq!(only_record(&a).status(), ApplicationStatus::Interviewing);
    }

    #[test]
    fn orphan_is_held_then_resolved() {
        let mut registry = ApplicationRegistry::new();
        let mut sm = machine();

        let report = sm.apply(&mut registry, vec![canonical("m2", EventKind::Interview, 3)]);
        assert_eq!(report.orphans_buffered, 1);
        assert!(registry.is_empty());
        assert_eq!(sm.pending().len(), 1);

        let report = sm.apply(&mut registry, vec![canonical("m1", EventKind::Applied, 0)]);
        assert_eq!(report.orphans_resolved, 1);
        assert!(sm.pending().is_empty());
        assert_eq!(only_record(&registry).status(), ApplicationStatus::Interviewing);
        assert_eq!(only_record(&registry).history().len(), 2);
    }

    #[test]
    fn orphan_is_discarded_after_grace_cycle() {
        let mut registry = ApplicationRegistry::new();
        let mut sm = machine();
        sm.apply(&mut registry, vec![canonical("m2", EventKind::Rejected, 3)]);
        let report = sm.apply(&mut registry, vec![]);
        assert_eq!(report.orphans_discarded, 1);
        assert!(sm.pending().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn orphan_in_same_batch_as_later_applied_is_matched() {
        let mut registry = ApplicationRegistry::new();
        let mut sm = machine();
        // The ACK is dated before the APPLIED confirmation.
        let report = sm.apply(
            &mut registry,
            vec![
                canonical("m1", EventKind::Applied, 1),
                canonical("m2", EventKind::Ack, 0),
            ],
        );
        assert_eq!(report.orphans_buffered, 0);
        let record = only_record(&registry);
        assert_eq!(record.history().len(), 2);
        assert_eq!(record.history()[0].kind, EventKind::Ack);
        assert_eq!(record.status(), ApplicationStatus::Applied);
    }

    #[test]
    fn status_change_is_reported() {
        let mut registry = ApplicationRegistry::new();
        let mut sm = machine();
        sm.apply(&mut registry, vec![canonical("m1", EventKind::Applied, 0)]);
        let report = sm.apply(&mut registry, vec![canonical("m2", EventKind::Offer, 10)]);
        assert_eq!(report.status_changes.len(), 1);
        assert_eq!(report.status_changes[0].from, ApplicationStatus::Applied);
        assert_eq!(report.status_changes[0].to, ApplicationStatus::Offered);
    }
}
