//! Mail source abstraction: yields raw message records per polling cycle.
//!
//! Sources are pure I/O: they hand back undecoded RFC 822 payloads and
//! never interpret them. Decoding happens in the normalizer.

pub mod imap;

pub use imap::{ImapConfig, ImapMailSource};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;

/// One raw message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Transport-native id (IMAP UID, API message id, ...).
    pub provider_message_id: String,
    /// Undecoded RFC 822 bytes.
    pub raw_payload: Vec<u8>,
    /// Receive time reported by the transport, used when the `Date` header is absent.
    pub received_hint: Option<DateTime<Utc>>,
}

impl RawMessage {
    pub fn new(provider_message_id: impl Into<String>, raw_payload: impl Into<Vec<u8>>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            raw_payload: raw_payload.into(),
            received_hint: None,
        }
    }

    pub fn with_received_hint(mut self, at: DateTime<Utc>) -> Self {
        self.received_hint = Some(at);
        self
    }
}

/// An already-authorized source of raw messages.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Source name, for logging.
    fn name(&self) -> &str;

    /// Fetch the next finite batch of raw messages.
    async fn fetch_batch(&self) -> Result<Vec<RawMessage>, MailError>;

    /// Confirm that a batch was fully processed.
    ///
    /// Called only after the cycle that consumed these ids completed.
    async fn acknowledge(&self, _provider_message_ids: &[String]) -> Result<(), MailError> {
        Ok(())
    }
}
