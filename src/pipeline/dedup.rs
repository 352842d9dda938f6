//! Deduplicator: collapses repeated extractions into canonical events.
//!
//! Events are grouped by `DedupKey`. Inside a group, events within the merge
//! window of a cluster's earliest event collapse into one `CanonicalEvent`;
//! anything later starts a new cluster, so a re-opened role stays distinct.

use std::collections::BTreeMap;

use tracing::debug;

use crate::pipeline::types::{CanonicalEvent, DedupKey, ExtractedEvent};

/// Groups and merges extracted events for one processing cycle.
#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    window: chrono::Duration,
}

impl Deduplicator {
    pub fn new(window: chrono::Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    /// Collapse a batch into canonical events, ordered by anchor and then
    /// by key.
    pub fn dedup(&self, events: &[ExtractedEvent]) -> Vec<CanonicalEvent> {
        let mut groups: BTreeMap<DedupKey, Vec<&ExtractedEvent>> = BTreeMap::new();
        for event in events {
            groups.entry(event.dedup_key()).or_default().push(event);
        }

        let mut canonical = Vec::new();
        for (key, mut group) in groups {
            group.sort_by(|a, b| {
                a.occurred_at
                    .cmp(&b.occurred_at)
                    .then_with(|| a.source_message_id.cmp(&b.source_message_id))
            });

            let mut anchor = None;
            let mut current: Option<CanonicalEvent> = None;
            for event in group {
                let candidate = CanonicalEvent::from_extracted(event);
                let joins = anchor.is_some_and(|start| event.occurred_at - start <= self.window);
                if joins && let Some(cluster) = current.as_mut() {
                    cluster.absorb(&candidate);
                    continue;
                }
                if let Some(done) = current.replace(candidate) {
                    canonical.push(done);
                }
                anchor = Some(event.occurred_at);
            }
            if let Some(done) = current {
                canonical.push(done);
            }
            debug!(company = %key.company, role = %key.role, kind = %key.kind, "Deduplicated key group");
        }

        canonical.sort_by(|a, b| {
            a.anchored_at
                .cmp(&b.anchored_at)
                .then_with(|| a.dedup_key.cmp(&b.dedup_key))
        });
        canonical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    use crate::pipeline::types::EventKind;

    fn t(hours: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-06T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::hours(hours)
    }

    fn event(id: &str, company: &str, kind: EventKind, hours: i64, confidence: f64) -> ExtractedEvent {
        ExtractedEvent {
            source_message_id: id.into(),
            company: company.into(),
            role: "Backend Engineer".into(),
            kind,
            occurred_at: t(hours),
            confidence,
        }
    }

    fn dedup(events: &[ExtractedEvent]) -> Vec<CanonicalEvent> {
        Deduplicator::new(Duration::hours(48)).dedup(events)
    }

    #[test]
    fn collapses_events_within_window() {
        let out = dedup(&[
            event("m1", "Acme", EventKind::Applied, 0, 0.9),
            event("m2", "Acme, Inc.", EventKind::Applied, 30, 0.7),
        ]);
        assert_eq!(out.len(), 1);
        let ids: Vec<_> = out[0].supporting_message_ids.iter().cloned().collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(out[0].occurred_at, t(0));
    }

    #[test]
    fn events_outside_window_stay_distinct() {
        let out = dedup(&[
            event("m1", "Acme", EventKind::Applied, 0, 0.9),
            event("m2", "Acme", EventKind::Applied, 49, 0.9),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn windows_are_anchored_not_chained() {
        let out = dedup(&[
            event("m1", "Acme", EventKind::Applied, 0, 0.9),
            event("m2", "Acme", EventKind::Applied, 40, 0.9),
            event("m3", "Acme", EventKind::Applied, 80, 0.9),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].supporting_message_ids.len(), 2);
        assert!(out[1].supporting_message_ids.contains("m3"));
    }

    #[test]
    fn cluster_keeps_its_anchor_when_a_later_event_wins() {
        let out = dedup(&[
            event("m0", "Acme", EventKind::Applied, 0, 0.5),
            event("m40", "Acme", EventKind::Applied, 40, 0.9),
            event("m50", "Acme", EventKind::Applied, 50, 0.9),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].occurred_at, t(40));
        assert_eq!(out[0].anchored_at, t(0));
        assert_eq!(out[1].anchored_at, t(50));
        assert!(!out[0].corroborates(&out[1], Duration::hours(48)));
    }

    #[test]
    fn highest_confidence_wins_canonical_fields() {
        let out = dedup(&[
            event("m1", "acme", EventKind::Interview, 0, 0.5),
            event("m2", "Acme", EventKind::Interview, 5, 0.95),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].occurred_at, t(5));
        assert_eq!(out[0].company, "Acme");
        assert!((out[0].confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn equal_confidence_prefers_earlier() {
        let out = dedup(&[
            event("m2", "Acme", EventKind::Offer, 10, 0.8),
            event("m1", "Acme", EventKind::Offer, 2, 0.8),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].occurred_at, t(2));
    }

    #[test]
    fn different_kinds_do_not_merge() {
        let out = dedup(&[
            event("m1", "Acme", EventKind::Applied, 0, 0.9),
            event("m2", "Acme", EventKind::Ack, 1, 0.9),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, EventKind::Applied);
        assert_eq!(out[1].kind, EventKind::Ack);
    }

    #[test]
    fn output_is_chronological_across_keys() {
        let out = dedup(&[
            event("m1", "Globex", EventKind::Applied, 20, 0.9),
            event("m2", "Acme", EventKind::Applied, 0, 0.9),
            event("m3", "Acme", EventKind::Interview, 100, 0.9),
        ]);
        let companies: Vec<_> = out.iter().map(|c| c.dedup_key.company.as_str()).collect();
        assert_eq!(companies, vec!["acme", "globex", "acme"]);
    }

    #[test]
    fn empty_batch() {
        assert!(dedup(&[]).is_empty());
    }
}
