//! Extraction adapter: normalized message → validated `ExtractedEvent`s.
//!
//! The extraction capability (an LLM call) is untrusted: its output is
//! parsed leniently, validated and coerced here, and never reaches the
//! deduplicator in raw form.
//!
//! Failure handling per message:
//! - `ProviderError` and timeouts are retried with backoff, then degrade to zero events
//! - `MalformedOutput` degrades to zero events immediately
//! - `Throttled` stops new calls for the batch and hands the unprocessed
//!   messages back to the caller

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::{ExtractionError, LlmError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{EventKind, ExtractedEvent, NormalizedMessage};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Max tokens for the extraction call.
const EXTRACTION_MAX_TOKENS: u32 = 1024;

/// Temperature for extraction (deterministic-ish).
const EXTRACTION_TEMPERATURE: f32 = 0.0;

/// How far past `received_at` a claimed `occurred_at` may lie.
const MAX_FUTURE_SKEW_HOURS: i64 = 24;

// ── Capability boundary ─────────────────────────────────────────────

/// Input sent to the extraction capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub text: String,
    pub context_hint: Option<String>,
}

/// One event-shaped record as returned by the capability. Every field is optional
/// because nothing about the output is trusted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEventRecord {
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<String>,
    /// Number or numeric string.
    #[serde(default)]
    pub confidence: Option<serde_json::Value>,
}

/// Capability response: ordered event-shaped records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResponse {
    #[serde(default)]
    pub events: Vec<RawEventRecord>,
}

/// An external AI service that turns message text into event-shaped records.
#[async_trait]
pub trait ExtractionCapability: Send + Sync {
    /// Capability name, for logging.
    fn name(&self) -> &str;

    async fn extract(&self, request: ExtractionRequest)
    -> Result<ExtractionResponse, ExtractionError>;
}

// ── LLM-backed capability ───────────────────────────────────────────

/// Extraction capability backed by any `LlmProvider`.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ExtractionCapability for LlmExtractor {
    fn name(&self) -> &str {
        self.llm.model_name()
    }

    async fn extract(
        &self,
        request: ExtractionRequest,
    ) -> Result<ExtractionResponse, ExtractionError> {
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(build_extraction_system_prompt()),
            ChatMessage::user(build_extraction_user_prompt(&request)),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = self.llm.complete(completion).await.map_err(map_llm_error)?;

        parse_extraction_response(&response.content).map_err(|e| {
            warn!(
                raw_response = %response.content,
                error = %e,
                "Failed to parse extraction response"
            );
            ExtractionError::MalformedOutput(e)
        })
    }
}

fn map_llm_error(err: LlmError) -> ExtractionError {
    match err {
        LlmError::RateLimited { retry_after, .. } => ExtractionError::Throttled { retry_after },
        LlmError::InvalidResponse { reason, .. } => ExtractionError::MalformedOutput(reason),
        LlmError::Json(e) => ExtractionError::MalformedOutput(e.to_string()),
        other => ExtractionError::ProviderError(other.to_string()),
    }
}

fn build_extraction_system_prompt() -> String {
    "You extract job-application lifecycle events from a single email.\n\n\
     Event kinds:\n\
     - \"APPLIED\": the user submitted an application (confirmation of submission)\n\
     - \"ACK\": the company acknowledged or is reviewing the application\n\
     - \"INTERVIEW\": an interview or screening is being scheduled or confirmed\n\
     - \"OFFER\": a job offer was extended\n\
     - \"REJECTED\": the application was declined or an offer was rescinded\n\
     - \"WITHDRAWN\": the user withdrew from the process\n\n\
     Respond with ONLY a JSON object:\n\
     {\"events\": [{\"company\": \"...\", \"role\": \"...\", \"kind\": \"...\", \"occurred_at\": \"YYYY-MM-DD or RFC 3339\", \"confidence\": 0.0}]}\n\n\
     Rules:\n\
     - Return {\"events\": []} for newsletters, job alerts and anything without an application signal\n\
     - One event per distinct (company, role, kind) mentioned\n\
     - occurred_at is when the event happened, not when an interview will take place\n\
     - confidence is 0.0-1.0; above 0.8 only when company, role and kind are explicit"
        .to_string()
}

fn build_extraction_user_prompt(request: &ExtractionRequest) -> String {
    let mut prompt = String::with_capacity(request.text.len() + 128);
    if let Some(ref hint) = request.context_hint {
        prompt.push_str(&format!("Context: {hint}\n\n"));
    }
    prompt.push_str("Email:\n");
    prompt.push_str(&request.text);
    prompt
}

/// Parse model output into a response. Accepts `{"events": [...]}` or a bare array.
fn parse_extraction_response(raw: &str) -> Result<ExtractionResponse, String> {
    let json_str = extract_json(raw);
    if json_str.starts_with('[') {
        let events: Vec<RawEventRecord> =
            serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;
        return Ok(ExtractionResponse { events });
    }
    serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))
}

/// Extract the first JSON object or array from LLM output (handles markdown wrapping).
fn extract_json(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

// ── Validation ──────────────────────────────────────────────────────

/// Why a raw record was rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRecord {
    MissingCompany,
    MissingRole,
    MissingConfidence,
}

/// Validate and coerce one raw record against the message it came from.
pub fn validate_record(
    record: &RawEventRecord,
    message: &NormalizedMessage,
) -> Result<ExtractedEvent, InvalidRecord> {
    let company = non_blank(record.company.as_deref()).ok_or(InvalidRecord::MissingCompany)?;
    let role = non_blank(record.role.as_deref()).ok_or(InvalidRecord::MissingRole)?;
    let confidence = parse_confidence(record.confidence.as_ref())
        .ok_or(InvalidRecord::MissingConfidence)?;

    let kind = record
        .kind
        .as_deref()
        .map(EventKind::parse_lenient)
        .unwrap_or(EventKind::Unknown);

    let latest_plausible = message.received_at + chrono::Duration::hours(MAX_FUTURE_SKEW_HOURS);
    let occurred_at = record
        .occurred_at
        .as_deref()
        .and_then(parse_occurred_at)
        .filter(|at| *at <= latest_plausible)
        .unwrap_or(message.received_at);

    Ok(ExtractedEvent {
        source_message_id: message.id.clone(),
        company: company.to_string(),
        role: role.to_string(),
        kind,
        occurred_at,
        confidence,
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_confidence(value: Option<&serde_json::Value>) -> Option<f64> {
    let raw = match value? {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if raw.is_nan() {
        return None;
    }
    Some(raw.clamp(0.0, 1.0))
}

/// RFC 3339, naive `YYYY-MM-DDTHH:MM:SS` (UTC) or `YYYY-MM-DD` (midnight UTC).
fn parse_occurred_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

// ── Adapter ─────────────────────────────────────────────────────────

/// Outcome of extracting a single message.
#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    /// Events that passed validation and the confidence threshold.
    Events {
        events: Vec<ExtractedEvent>,
        below_threshold: usize,
        invalid: usize,
    },
    /// Provider failed after retries, or output was malformed. Zero events.
    Degraded(ExtractionError),
    /// Rate limited; the message must be retried later.
    Throttled { retry_after: Option<Duration> },
    /// Not attempted because the batch was already throttled.
    NotAttempted,
}

/// Counters for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub attempted: usize,
    pub events: usize,
    pub below_threshold: usize,
    pub invalid: usize,
    pub malformed: usize,
    pub provider_failures: usize,
}

/// Result of a batch extraction.
#[derive(Debug, Clone, Default)]
pub struct BatchExtraction {
    /// Events in message order, then record order.
    pub events: Vec<ExtractedEvent>,
    /// Ids of messages whose extraction finished (including degraded ones).
    pub completed: Vec<String>,
    /// Messages to retry after a throttle pause, in their original order.
    pub remaining: Vec<NormalizedMessage>,
    /// Set when the capability throttled during this batch.
    pub throttled: Option<Option<Duration>>,
    pub stats: ExtractionStats,
}

/// Wraps an `ExtractionCapability` with retry, timeout, validation and the
/// confidence threshold.
pub struct ExtractionAdapter {
    capability: Arc<dyn ExtractionCapability>,
    retry: RetryPolicy,
    timeout: Duration,
    threshold: f64,
    concurrency: usize,
    max_chars: usize,
}

impl ExtractionAdapter {
    pub fn new(capability: Arc<dyn ExtractionCapability>, config: &TrackerConfig) -> Self {
        Self {
            capability,
            retry: config.extraction_retry,
            timeout: config.extraction_timeout,
            threshold: config.confidence_threshold,
            concurrency: config.extraction_concurrency.max(1),
            max_chars: config.extraction_max_chars,
        }
    }

    /// Extract one message.
    pub async fn extract(&self, message: &NormalizedMessage) -> ExtractionOutcome {
        let request = self.build_request(message);
        let capability = self.capability.as_ref();
        let timeout = self.timeout;

        let retried = retry_with_backoff(
            &self.retry,
            |e: &ExtractionError| matches!(e, ExtractionError::ProviderError(_)),
            |attempt| {
                let request = request.clone();
                async move {
                    debug!(id = %message.id, attempt, "Calling extraction capability");
                    match tokio::time::timeout(timeout, capability.extract(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(ExtractionError::ProviderError(format!(
                            "extraction call timed out after {timeout:?}"
                        ))),
                    }
                }
            },
        )
        .await;

        match retried.result {
            Ok(response) => self.accept(message, &response),
            Err(ExtractionError::Throttled { retry_after }) => {
                warn!(id = %message.id, ?retry_after, "Extraction throttled");
                ExtractionOutcome::Throttled { retry_after }
            }
            Err(e) => {
                warn!(
                    id = %message.id,
                    attempts = retried.attempts,
                    kind = e.label(),
                    error = %e,
                    "Extraction failed, treating message as carrying no events"
                );
                ExtractionOutcome::Degraded(e)
            }
        }
    }

    /// Extract a batch with bounded concurrency.
    ///
    /// Once any call is throttled, calls that have not started yet are
    /// skipped; calls already in flight are allowed to finish and keep
    /// their results.
    pub async fn extract_batch(&self, messages: Vec<NormalizedMessage>) -> BatchExtraction {
        let throttled = AtomicBool::new(false);
        let throttled = &throttled;

        let mut outcomes: Vec<(usize, NormalizedMessage, ExtractionOutcome)> =
            futures::stream::iter(messages.into_iter().enumerate())
                .map(|(idx, message)| async move {
                    if throttled.load(Ordering::SeqCst) {
                        return (idx, message, ExtractionOutcome::NotAttempted);
                    }
                    let outcome = self.extract(&message).await;
                    if matches!(outcome, ExtractionOutcome::Throttled { .. }) {
                        throttled.store(true, Ordering::SeqCst);
                    }
                    (idx, message, outcome)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        outcomes.sort_by_key(|(idx, _, _)| *idx);

        let mut batch = BatchExtraction::default();
        for (_, message, outcome) in outcomes {
            match outcome {
                ExtractionOutcome::Events {
                    events,
                    below_threshold,
                    invalid,
                } => {
                    batch.stats.attempted += 1;
                    batch.stats.events += events.len();
                    batch.stats.below_threshold += below_threshold;
                    batch.stats.invalid += invalid;
                    batch.events.extend(events);
                    batch.completed.push(message.id);
                }
                ExtractionOutcome::Degraded(e) => {
                    batch.stats.attempted += 1;
                    match e {
                        ExtractionError::MalformedOutput(_) => batch.stats.malformed += 1,
                        _ => batch.stats.provider_failures += 1,
                    }
                    batch.completed.push(message.id);
                }
                ExtractionOutcome::Throttled { retry_after } => {
                    batch.stats.attempted += 1;
                    // Keep the longest hint seen.
                    batch.throttled = Some(match batch.throttled.flatten() {
                        Some(prev) => Some(retry_after.map_or(prev, |r| r.max(prev))),
                        None => retry_after,
                    });
                    batch.remaining.push(message);
                }
                ExtractionOutcome::NotAttempted => batch.remaining.push(message),
            }
        }

        info!(
            capability = self.capability.name(),
            attempted = batch.stats.attempted,
            events = batch.stats.events,
            below_threshold = batch.stats.below_threshold,
            malformed = batch.stats.malformed,
            provider_failures = batch.stats.provider_failures,
            remaining = batch.remaining.len(),
            "Extraction batch complete"
        );
        batch
    }

    fn build_request(&self, message: &NormalizedMessage) -> ExtractionRequest {
        let body: String = message.body.chars().take(self.max_chars).collect();
        ExtractionRequest {
            text: format!(
                "From: {}\nSubject: {}\n\n{}",
                message.sender, message.subject, body
            ),
            context_hint: Some(format!(
                "email received at {}",
                message.received_at.to_rfc3339()
            )),
        }
    }

    fn accept(&self, message: &NormalizedMessage, response: &ExtractionResponse) -> ExtractionOutcome {
        let mut events = Vec::with_capacity(response.events.len());
        let mut below_threshold = 0;
        let mut invalid = 0;

        for record in &response.events {
            match validate_record(record, message) {
                Ok(event) if event.confidence < self.threshold => {
                    debug!(
                        id = %message.id,
                        kind = %event.kind,
                        confidence = event.confidence,
                        threshold = self.threshold,
                        "Discarding low-confidence event"
                    );
                    below_threshold += 1;
                }
                Ok(event) => events.push(event),
                Err(reason) => {
                    warn!(id = %message.id, ?reason, "Dropping invalid extracted record");
                    invalid += 1;
                }
            }
        }

        ExtractionOutcome::Events {
            events,
            below_threshold,
            invalid,
        }
    }
}
