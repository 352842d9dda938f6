//! Shared types for the extraction pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ── Normalized message ──────────────────────────────────────────────

/// Canonical form of one inbound email.
///
/// Built by the normalizer and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Stable id derived from the source (Message-ID, else provider id).
    pub id: String,
    /// Lowercased sender address.
    pub sender: String,
    pub subject: String,
    /// Plain text body with HTML and quoted replies removed.
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Why a raw message was excluded from processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyPayload,
    DecodeFailed,
    NoTextContent,
    MissingDate,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EmptyPayload => "empty_payload",
            Self::DecodeFailed => "decode_failed",
            Self::NoTextContent => "no_text_content",
            Self::MissingDate => "missing_date",
        };
        write!(f, "{s}")
    }
}

/// Marker for a raw message that produced no `NormalizedMessage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMessage {
    pub provider_message_id: String,
    pub reason: SkipReason,
}

/// Outcome of normalizing one raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Message(NormalizedMessage),
    Skipped(SkippedMessage),
}

// ── Event kinds ─────────────────────────────────────────────────────

/// Lifecycle signal carried by an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Applied,
    Ack,
    Interview,
    Offer,
    Rejected,
    Withdrawn,
    Unknown,
}

impl EventKind {
    /// Position in the rank table used for terminal-state overrides.
    ///
    /// `APPLIED(0) = ACK(0) < INTERVIEW(1) < OFFER(2) = REJECTED(2) = WITHDRAWN(2)`.
    /// `UNKNOWN` carries no lifecycle signal and has no rank.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Applied | Self::Ack => Some(0),
            Self::Interview => Some(1),
            Self::Offer | Self::Rejected | Self::Withdrawn => Some(2),
            Self::Unknown => None,
        }
    }

    /// Lenient parse of a model-produced label. Unrecognised labels map to `Unknown`.
    pub fn parse_lenient(label: &str) -> Self {
        let normalized: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        match normalized.as_str() {
            "applied" | "application" | "application_sent" | "application_received" => {
                Self::Applied
            }
            "ack" | "acknowledged" | "acknowledgement" | "acknowledgment" | "in_review"
            | "under_review" => Self::Ack,
            "interview" | "interview_scheduled" | "interviewing" | "screening" => {
                Self::Interview
            }
            "offer" | "offered" | "offer_extended" => Self::Offer,
            "rejected" | "rejection" | "declined" => Self::Rejected,
            "withdrawn" | "withdrew" | "withdrawal" => Self::Withdrawn,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "APPLIED",
            Self::Ack => "ACK",
            Self::Interview => "INTERVIEW",
            Self::Offer => "OFFER",
            Self::Rejected => "REJECTED",
            Self::Withdrawn => "WITHDRAWN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Extracted event ─────────────────────────────────────────────────

/// Candidate event produced by the extraction adapter, already validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub source_message_id: String,
    pub company: String,
    pub role: String,
    pub kind: EventKind,
    /// Best-effort; equals the message's `received_at` when unknown.
    pub occurred_at: DateTime<Utc>,
    /// Always within [0, 1].
    pub confidence: f64,
}

impl ExtractedEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.company, &self.role, self.kind)
    }
}

// ── Dedup key ───────────────────────────────────────────────────────

/// `(normalized_company, normalized_role, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub company: String,
    pub role: String,
    pub kind: EventKind,
}

impl DedupKey {
    pub fn new(company: &str, role: &str, kind: EventKind) -> Self {
        Self {
            company: normalize_company(company),
            role: normalize_role(role),
            kind,
        }
    }

    /// The (company, role) pair identifying the application.
    pub fn application_key(&self) -> (&str, &str) {
        (&self.company, &self.role)
    }
}

static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9+#]+").expect("static regex"));

const COMPANY_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "llc", "ltd", "limited", "corp", "corporation", "co", "gmbh", "plc",
    "ag", "sa", "bv", "pty",
];

fn tokens(raw: &str) -> Vec<String> {
    NON_ALNUM
        .replace_all(&raw.to_lowercase(), " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Lowercase, strip punctuation and trailing legal-entity suffixes.
///
/// `"Acme, Inc."` and `"ACME"` normalize to the same value.
pub fn normalize_company(raw: &str) -> String {
    let mut parts = tokens(raw);
    while parts.len() > 1
        && parts
            .last()
            .is_some_and(|last| COMPANY_SUFFIXES.contains(&last.as_str()))
    {
        parts.pop();
    }
    parts.join(" ")
}

/// Lowercase, strip punctuation and expand common seniority abbreviations.
pub fn normalize_role(raw: &str) -> String {
    tokens(raw)
        .into_iter()
        .map(|t| match t.as_str() {
            "sr" => "senior".to_string(),
            "jr" => "junior".to_string(),
            "eng" | "engr" => "engineer".to_string(),
            "swe" => "software engineer".to_string(),
            _ => t,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Canonical event ─────────────────────────────────────────────────

/// An extracted event promoted past deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub dedup_key: DedupKey,
    /// Display company name taken from the canonical (winning) event.
    pub company: String,
    /// Display role taken from the canonical (winning) event.
    pub role: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    /// Earliest `occurred_at` among the supporting messages: the cluster's
    /// anchor. Merge windows are measured from it.
    pub anchored_at: DateTime<Utc>,
    pub confidence: f64,
    /// Every message that corroborated this event. Never empty.
    pub supporting_message_ids: BTreeSet<String>,
    /// Order in which the event entered its record's history; 0 until applied.
    #[serde(default)]
    pub arrival: u64,
}

impl CanonicalEvent {
    /// Promote a single extracted event.
    pub fn from_extracted(event: &ExtractedEvent) -> Self {
        Self {
            dedup_key: event.dedup_key(),
            company: event.company.trim().to_string(),
            role: event.role.trim().to_string(),
            kind: event.kind,
            occurred_at: event.occurred_at,
            anchored_at: event.occurred_at,
            confidence: event.confidence,
            supporting_message_ids: BTreeSet::from([event.source_message_id.clone()]),
            arrival: 0,
        }
    }

    /// Whether `other` should win canonical fields over `self`:
    /// higher confidence, or equal confidence and earlier `occurred_at`.
    pub fn is_outranked_by(&self, confidence: f64, occurred_at: DateTime<Utc>) -> bool {
        confidence > self.confidence
            || (confidence == self.confidence && occurred_at < self.occurred_at)
    }

    /// Whether `other` describes the same occurrence: same key, and either
    /// a shared supporting message or anchors within `window` of each other.
    pub fn corroborates(&self, other: &CanonicalEvent, window: chrono::Duration) -> bool {
        self.dedup_key == other.dedup_key
            && (!self
                .supporting_message_ids
                .is_disjoint(&other.supporting_message_ids)
                || (self.anchored_at - other.anchored_at).abs() <= window)
    }

    /// Fold a corroborating event into this one.
    pub fn absorb(&mut self, other: &CanonicalEvent) {
        if self.is_outranked_by(other.confidence, other.occurred_at) {
            self.company = other.company.clone();
            self.role = other.role.clone();
            self.kind = other.kind;
            self.occurred_at = other.occurred_at;
            self.confidence = other.confidence;
        }
        self.anchored_at = self.anchored_at.min(other.anchored_at);
        self.supporting_message_ids
            .extend(other.supporting_message_ids.iter().cloned());
    }
}
