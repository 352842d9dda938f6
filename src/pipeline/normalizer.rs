//! Message normalizer: raw RFC 822 payload → `NormalizedMessage`.
//!
//! Pure string/MIME work, no I/O. Payloads that cannot yield text become a
//! `SkippedMessage`; that is an expected outcome, not an error.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use regex::Regex;
use tracing::{debug, warn};

use crate::mail::RawMessage;
use crate::pipeline::types::{Normalized, NormalizedMessage, SkipReason, SkippedMessage};

/// Normalize one raw message.
pub fn normalize(raw: &RawMessage) -> Normalized {
    let skip = |reason: SkipReason| {
        warn!(
            provider_message_id = %raw.provider_message_id,
            reason = %reason,
            "Skipping message"
        );
        Normalized::Skipped(SkippedMessage {
            provider_message_id: raw.provider_message_id.clone(),
            reason,
        })
    };

    if raw.raw_payload.iter().all(|b| b.is_ascii_whitespace()) {
        return skip(SkipReason::EmptyPayload);
    }

    let Some(parsed) = MessageParser::default().parse(raw.raw_payload.as_slice()) else {
        return skip(SkipReason::DecodeFailed);
    };

    let Some(body) = extract_text(&parsed) else {
        return skip(SkipReason::NoTextContent);
    };
    let body = strip_quoted_text(&body);
    if body.trim().is_empty() {
        return skip(SkipReason::NoTextContent);
    }

    let Some(received_at) = parsed.date().and_then(to_utc).or(raw.received_hint) else {
        return skip(SkipReason::MissingDate);
    };

    let id = parsed
        .message_id()
        .map(|s| s.trim().trim_start_matches('<').trim_end_matches('>').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| raw.provider_message_id.clone());

    let message = NormalizedMessage {
        id,
        sender: extract_sender(&parsed),
        subject: collapse_whitespace(parsed.subject().unwrap_or_default()),
        body,
        received_at,
    };
    debug!(id = %message.id, sender = %message.sender, "Message normalized");
    Normalized::Message(message)
}

/// Normalize a batch, splitting messages from skip markers.
pub fn normalize_batch(raws: &[RawMessage]) -> (Vec<NormalizedMessage>, Vec<SkippedMessage>) {
    let mut messages = Vec::with_capacity(raws.len());
    let mut skipped = Vec::new();
    for raw in raws {
        match normalize(raw) {
            Normalized::Message(m) => messages.push(m),
            Normalized::Skipped(s) => skipped.push(s),
        }
    }
    (messages, skipped)
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
///
/// Prefers the text/plain body, then the HTML body, then any inline text part.
fn extract_text(parsed: &mail_parser::Message) -> Option<String> {
    let parts = [parsed.text_part(0), parsed.html_part(0)];
    for part in parts.into_iter().flatten() {
        let text = match &part.body {
            PartType::Text(text) => text.to_string(),
            PartType::Html(html) => strip_html(html.as_ref()),
            _ => continue,
        };
        if !text.trim().is_empty() {
            return Some(text);
        }
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
            && !text.trim().is_empty()
        {
            return Some(text.to_string());
        }
    }
    None
}

fn to_utc(date: &mail_parser::DateTime) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(
        i32::from(date.year),
        u32::from(date.month),
        u32::from(date.day),
    )?
    .and_hms_opt(
        u32::from(date.hour),
        u32::from(date.minute),
        u32::from(date.second),
    )?;
    let offset_secs = (i64::from(date.tz_hour) * 3600 + i64::from(date.tz_minute) * 60)
        * if date.tz_before_gmt { -1 } else { 1 };
    Some(naive.and_utc() - chrono::Duration::seconds(offset_secs))
}

static BLOCK_ELEMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)>").expect("static regex")
});
static LINE_BREAKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|li|h[1-6])>").expect("static regex")
});

/// Strip HTML tags from content, keeping paragraph breaks.
pub fn strip_html(html: &str) -> String {
    let without_blocks = BLOCK_ELEMENTS.replace_all(html, " ");
    let with_breaks = LINE_BREAKS.replace_all(&without_blocks, "\n");

    let mut result = String::with_capacity(with_breaks.len());
    let mut in_tag = false;
    for ch in with_breaks.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    decode_entities(&result)
        .lines()
        .map(collapse_whitespace)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip quoted text from an email body.
///
/// Removes `>`-prefixed lines and everything after an "On ... wrote:" or
/// "--- Original Message ---" separator. Forwarded content is kept, since
/// a forward usually is the signal.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line.trim_end());
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }
    while result.first().is_some_and(|l| l.trim().is_empty()) {
        result.remove(0);
    }

    result.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(payload: &str) -> RawMessage {
        RawMessage::new("uid-1", payload.as_bytes().to_vec())
    }

    const PLAIN: &str = "From: Acme Careers <Careers@Acme.com>\r\n\
        To: me@example.com\r\n\
        Subject: Thank you for applying\r\n\
        Message-ID: <abc123@acme.com>\r\n\
        Date: Mon, 6 Jan 2025 10:00:00 +0100\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Thank you for applying to Acme for Backend Engineer.\r\n\
        \r\n\
        On Sun, Jan 5, 2025 at 9:00 AM Me <me@example.com> wrote:\r\n\
        > my application\r\n";

    #[test]
    fn normalizes_plain_message() {
        let Normalized::Message(msg) = normalize(&raw(PLAIN)) else {
            panic!("expected message");
        };
        assert_eq!(msg.id, "abc123@acme.com");
        assert_eq!(msg.sender, "careers@acme.com");
        assert_eq!(msg.subject, "Thank you for applying");
        assert_eq!(msg.body, "Thank you for applying to Acme for Backend Engineer.");
        assert_eq!(msg.received_at.to_rfc3339(), "2025-01-06T09:00:00+00:00");
    }

    #[test]
    fn html_only_message_is_stripped() {
        let payload = "From: hr@globex.com\r\n\
            Subject: Interview\r\n\
            Date: Tue, 7 Jan 2025 12:00:00 +0000\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <html><head><style>p{color:red}</style></head><body><p>We&#39;d like to schedule an <b>interview</b>.</p><p>Thanks &amp; regards</p></body></html>\r\n";
        let Normalized::Message(msg) = normalize(&raw(payload)) else {
            panic!("expected message");
        };
        assert_eq!(msg.body, "We'd like to schedule an interview.\nThanks & regards");
        assert!(!msg.body.contains("color"));
    }

    #[test]
    fn missing_message_id_falls_back_to_provider_id() {
        let payload = PLAIN.replace("Message-ID: <abc123@acme.com>\r\n", "");
        let Normalized::Message(msg) = normalize(&raw(&payload)) else {
            panic!("expected message");
        };
        assert_eq!(msg.id, "uid-1");
    }

    #[test]
    fn empty_payload_is_skipped() {
        let outcome = normalize(&raw("   \r\n"));
        assert!(matches!(
            outcome,
            Normalized::Skipped(SkippedMessage { reason: SkipReason::EmptyPayload, .. })
        ));
    }

    #[test]
    fn missing_date_uses_transport_hint_or_skips() {
        let payload = PLAIN.replace("Date: Mon, 6 Jan 2025 10:00:00 +0100\r\n", "");
        assert!(matches!(
            normalize(&raw(&payload)),
            Normalized::Skipped(SkippedMessage { reason: SkipReason::MissingDate, .. })
        ));

        let hint = DateTime::parse_from_rfc3339("2025-01-06T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let Normalized::Message(msg) = normalize(&raw(&payload).with_received_hint(hint)) else {
            panic!("expected message");
        };
        assert_eq!(msg.received_at, hint);
    }

    #[test]
    fn batch_splits_messages_and_skips() {
        let (messages, skipped) = normalize_batch(&[raw(PLAIN), raw("")]);
        assert_eq!(messages.len(), 1);
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn strip_quoted_text_removes_quotes_keeps_forward() {
        let body = "FYI\n\n---------- Forwarded message ---------\nInterview invite\n> quoted";
        assert_eq!(
            strip_quoted_text(body),
            "FYI\n\n---------- Forwarded message ---------\nInterview invite"
        );
        assert_eq!(
            strip_quoted_text("My reply\n\n--- Original Message ---\nOld stuff"),
            "My reply"
        );
        assert_eq!(strip_quoted_text(""), "");
    }

    #[test]
    fn strip_html_basic_cases() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(strip_html("<div><b>Bold</b> and <i>italic</i></div>"), "Bold and italic");
        assert_eq!(strip_html("No HTML here"), "No HTML here");
        assert_eq!(strip_html(""), "");
    }
}
