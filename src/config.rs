//! Per-topic configuration options.

use std::time::Duration;

use crate::error::RediMqError;

/// Default idle threshold after which an unacknowledged delivery becomes
/// eligible for reclaim, matching the Go source's `DefaultMaxIdleTimeForMessage`.
pub const DEFAULT_MAX_IDLE_TIME_FOR_MESSAGES: &str = "5m";

/// Options accepted by [`crate::Client::new_topic`] and
/// [`crate::Client::new_grouped_topic`].
///
/// Absence of `max_retention` / `max_length` leaves the corresponding store
/// hint off; `max_idle_time_for_messages` always has a value, defaulting to
/// `5m` when not supplied.
#[derive(Debug, Clone)]
pub struct TopicOptions {
    /// Approximate retention window; older entries become trim-eligible.
    pub max_retention: Option<Duration>,
    /// Approximate max length hint passed to the store on publish.
    pub max_length: Option<i64>,
    /// Idle threshold after which an unacknowledged delivery may be reclaimed.
    pub max_idle_time_for_messages: Duration,
}

impl Default for TopicOptions {
    fn default() -> Self {
        TopicOptions {
            max_retention: None,
            max_length: None,
            max_idle_time_for_messages: parse_duration_str(DEFAULT_MAX_IDLE_TIME_FOR_MESSAGES)
                .expect("default idle duration string is valid"),
        }
    }
}

impl TopicOptions {
    /// Build options from parseable duration strings, the shape the wire-level
    /// config (and the original Go `TopicOptions`) uses.
    pub fn from_strings(
        max_retention: Option<&str>,
        max_length: Option<i64>,
        max_idle_time_for_messages: Option<&str>,
    ) -> Result<Self, RediMqError> {
        let max_retention = max_retention
            .map(|s| {
                parse_duration_str(s)
                    .map_err(|e| RediMqError::config_invalid("TopicOptions.max_retention", e))
            })
            .transpose()?;

        let max_idle_time_for_messages = match max_idle_time_for_messages {
            Some(s) => parse_duration_str(s)
                .map_err(|e| RediMqError::config_invalid("TopicOptions.max_idle_time_for_messages", e))?,
            None => parse_duration_str(DEFAULT_MAX_IDLE_TIME_FOR_MESSAGES).unwrap(),
        };

        Ok(TopicOptions {
            max_retention,
            max_length,
            max_idle_time_for_messages,
        })
    }
}

fn parse_duration_str(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_idle_is_five_minutes() {
        let opts = TopicOptions::default();
        assert_eq!(opts.max_idle_time_for_messages, Duration::from_secs(300));
        assert!(opts.max_retention.is_none());
        assert!(opts.max_length.is_none());
    }

    #[test]
    fn from_strings_parses_all_fields() {
        let opts = TopicOptions::from_strings(Some("24h"), Some(10_000), Some("30s")).unwrap();
        assert_eq!(opts.max_retention, Some(Duration::from_secs(24 * 3600)));
        assert_eq!(opts.max_length, Some(10_000));
        assert_eq!(opts.max_idle_time_for_messages, Duration::from_secs(30));
    }

    #[test]
    fn invalid_duration_is_config_invalid() {
        let err = TopicOptions::from_strings(Some("not-a-duration"), None, None).unwrap_err();
        assert!(matches!(err, RediMqError::ConfigInvalid { .. }));
    }
}
