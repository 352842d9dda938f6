//! Configuration types.
//!
//! Every knob is read from a `JOB_TRACKER_*` environment variable and falls
//! back to the documented default when unset.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Engine configuration for one tracker instance.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Extracted events below this confidence never reach the deduplicator.
    pub confidence_threshold: f64,
    /// Events with the same dedup key inside this window collapse into one.
    pub merge_window: chrono::Duration,
    /// Retry policy for transient extraction provider failures.
    pub extraction_retry: RetryPolicy,
    /// Maximum concurrent extraction calls within a cycle.
    pub extraction_concurrency: usize,
    /// Timeout for a single extraction call.
    pub extraction_timeout: Duration,
    /// Characters of message body sent to the extraction capability.
    pub extraction_max_chars: usize,
    /// Retry policy for spreadsheet operations.
    pub sync_retry: RetryPolicy,
    /// Timeout for a single spreadsheet operation.
    pub sync_timeout: Duration,
    /// Pause applied when the extraction capability throttles without a hint.
    pub throttle_pause: Duration,
    /// Throttle pauses allowed per cycle before the rest is carried over.
    pub max_throttle_pauses: u32,
    /// Consecutive fully-failed cycles before degraded mode is signalled.
    pub degraded_after_cycles: u32,
    /// Extra cycles an orphan event waits for its APPLIED event.
    pub orphan_grace_cycles: u32,
    /// Interval between polling cycles.
    pub poll_interval: Duration,
    /// Maximum raw messages pulled from the mail source per cycle.
    pub max_messages_per_cycle: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.4,
            merge_window: chrono::Duration::hours(48),
            extraction_retry: RetryPolicy::default(),
            extraction_concurrency: 5,
            extraction_timeout: Duration::from_secs(30),
            extraction_max_chars: 6000,
            sync_retry: RetryPolicy::default(),
            sync_timeout: Duration::from_secs(15),
            throttle_pause: Duration::from_secs(30),
            max_throttle_pauses: 3,
            degraded_after_cycles: 3,
            orphan_grace_cycles: 1,
            poll_interval: Duration::from_secs(300),
            max_messages_per_cycle: 200,
        }
    }
}

impl TrackerConfig {
    /// Build config from environment variables, using defaults for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let confidence_threshold: f64 = env_parse(
            "JOB_TRACKER_CONFIDENCE_THRESHOLD",
            defaults.confidence_threshold,
        )?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "JOB_TRACKER_CONFIDENCE_THRESHOLD".into(),
                message: format!("{confidence_threshold} is outside [0, 1]"),
            });
        }

        let merge_window = parse_merge_window(env_parse("JOB_TRACKER_MERGE_WINDOW_HOURS", 48)?)?;

        let backoff_base = Duration::from_millis(env_parse(
            "JOB_TRACKER_BACKOFF_BASE_MS",
            defaults.extraction_retry.base_delay.as_millis() as u64,
        )?);
        let backoff_max = Duration::from_millis(env_parse(
            "JOB_TRACKER_BACKOFF_MAX_MS",
            defaults.extraction_retry.max_delay.as_millis() as u64,
        )?);

        let extraction_retry = RetryPolicy::new(
            env_positive("JOB_TRACKER_EXTRACTION_ATTEMPTS", 3)?,
            backoff_base,
            backoff_max,
        );
        let sync_retry = RetryPolicy::new(
            env_positive("JOB_TRACKER_SYNC_ATTEMPTS", 3)?,
            backoff_base,
            backoff_max,
        );

        Ok(Self {
            confidence_threshold,
            merge_window,
            extraction_retry,
            extraction_concurrency: env_positive(
                "JOB_TRACKER_EXTRACTION_CONCURRENCY",
                defaults.extraction_concurrency as u32,
            )? as usize,
            extraction_timeout: Duration::from_secs(env_parse(
                "JOB_TRACKER_EXTRACTION_TIMEOUT_SECS",
                defaults.extraction_timeout.as_secs(),
            )?),
            extraction_max_chars: env_parse(
                "JOB_TRACKER_EXTRACTION_MAX_CHARS",
                defaults.extraction_max_chars,
            )?,
            sync_retry,
            sync_timeout: Duration::from_secs(env_parse(
                "JOB_TRACKER_SYNC_TIMEOUT_SECS",
                defaults.sync_timeout.as_secs(),
            )?),
            throttle_pause: Duration::from_secs(env_parse(
                "JOB_TRACKER_THROTTLE_PAUSE_SECS",
                defaults.throttle_pause.as_secs(),
            )?),
            max_throttle_pauses: env_parse(
                "JOB_TRACKER_MAX_THROTTLE_PAUSES",
                defaults.max_throttle_pauses,
            )?,
            degraded_after_cycles: env_positive(
                "JOB_TRACKER_DEGRADED_AFTER_CYCLES",
                defaults.degraded_after_cycles,
            )?,
            orphan_grace_cycles: env_parse(
                "JOB_TRACKER_ORPHAN_GRACE_CYCLES",
                defaults.orphan_grace_cycles,
            )?,
            poll_interval: Duration::from_secs(env_positive(
                "JOB_TRACKER_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs() as u32,
            )? as u64),
            max_messages_per_cycle: env_positive(
                "JOB_TRACKER_MAX_MESSAGES_PER_CYCLE",
                defaults.max_messages_per_cycle as u32,
            )? as usize,
        })
    }
}

/// Validate a merge window given in hours.
fn parse_merge_window(hours: i64) -> Result<chrono::Duration, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "JOB_TRACKER_MERGE_WINDOW_HOURS".into(),
        message: message.into(),
    };
    if hours < 0 {
        return Err(invalid("must not be negative"));
    }
    chrono::Duration::try_hours(hours)
        .ok_or_else(|| invalid(&format!("{hours} hours is out of range")))
}

/// Parse an optional environment variable, returning `default` when unset.
pub(crate) fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_positive(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value: u32 = env_parse(key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1".into(),
        });
    }
    Ok(value)
}

/// Read a required environment variable.
pub(crate) fn env_required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TrackerConfig::default();
        assert!((config.confidence_threshold - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.merge_window, chrono::Duration::hours(48));
        assert_eq!(config.extraction_retry.max_attempts, 3);
        assert_eq!(config.extraction_concurrency, 5);
        assert_eq!(config.extraction_timeout, Duration::from_secs(30));
        assert_eq!(config.sync_timeout, Duration::from_secs(15));
        assert_eq!(config.orphan_grace_cycles, 1);
    }

    #[test]
    fn merge_window_rejects_out_of_range_hours() {
        assert_eq!(parse_merge_window(48).unwrap(), chrono::Duration::hours(48));
        assert!(matches!(parse_merge_window(-1), Err(ConfigError::InvalidValue { .. })));
        let err = parse_merge_window(i64::MAX).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "JOB_TRACKER_MERGE_WINDOW_HOURS")
        );
    }

    #[test]
    fn env_parse_falls_back_when_unset() {
        let value: u32 = env_parse("JOB_TRACKER_TEST_SURELY_UNSET_KEY", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn env_required_reports_missing_key() {
        let err = env_required("JOB_TRACKER_TEST_SURELY_UNSET_REQUIRED").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k.contains("REQUIRED")));
    }
}
