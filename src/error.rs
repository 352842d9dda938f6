//! Error types for the job tracker.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mail source errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail source {source_name} fetch failed: {reason}")]
    FetchFailed { source_name: String, reason: String },

    #[error("Mail source {source_name} acknowledge failed: {reason}")]
    AcknowledgeFailed { source_name: String, reason: String },

    #[error("Mail source task panicked: {0}")]
    TaskPanicked(String),
}

/// Typed failure modes of the extraction capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extraction throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Option<Duration> },

    #[error("Extraction provider error: {0}")]
    ProviderError(String),

    #[error("Malformed extraction output: {0}")]
    MalformedOutput(String),
}

impl ExtractionError {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Throttled { .. } => "throttled",
            Self::ProviderError(_) => "provider_error",
            Self::MalformedOutput(_) => "malformed_output",
        }
    }
}

/// Spreadsheet store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Spreadsheet store rate limited")]
    RateLimited,

    #[error("Spreadsheet request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Spreadsheet transport error: {0}")]
    Transport(String),

    #[error("Spreadsheet operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected spreadsheet response: {0}")]
    InvalidResponse(String),
}

impl SyncError {
    /// Whether a retry may succeed: rate limits, timeouts, transport and 5xx failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Timeout(_) | Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Cycle cancelled before stage {stage}")]
    Cancelled { stage: &'static str },
}
