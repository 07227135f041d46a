//! Schedule parsing and timing policy
//!
//! Validates one-shot schedule instants, computes cron occurrences, and
//! holds the retry backoff curve used by the dispatcher. Cron expressions
//! are accepted in the common 5-field form and normalized to the 6-field
//! form (leading seconds) the parser expects.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{FanoutError, Result};

/// Reject past-dated one-shot schedules.
pub fn validate_scheduled_at(at: i64, now: i64) -> Result<()> {
    if at <= now {
        return Err(FanoutError::InvalidInput(format!(
            "scheduled_at must be in the future (got {}, now {})",
            at, now
        )));
    }
    Ok(())
}

/// Normalize a cron expression to the 6/7-field form, validating it parses.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(FanoutError::InvalidInput(
            "cron expression cannot be empty".to_string(),
        ));
    }

    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| {
        FanoutError::InvalidInput(format!("invalid cron expression '{}': {}", trimmed, e))
    })?;

    Ok(normalized)
}

/// The next occurrence of `expr` strictly after `after`, as a unix timestamp.
///
/// Returns `None` for an exhausted schedule (e.g. a fixed year in the past).
pub fn next_occurrence(expr: &str, after: i64) -> Result<Option<i64>> {
    let normalized = normalize_cron(expr)?;
    let schedule = Schedule::from_str(&normalized).map_err(|e| {
        FanoutError::InvalidInput(format!("invalid cron expression '{}': {}", expr, e))
    })?;

    let after_dt = DateTime::<Utc>::from_timestamp(after, 0).ok_or_else(|| {
        FanoutError::InvalidInput(format!("timestamp out of range: {}", after))
    })?;

    Ok(schedule.after(&after_dt).next().map(|dt| dt.timestamp()))
}

/// Exponential backoff delay before attempt `attempt + 1`, given `attempt`
/// failures so far. Doubles from `base` and saturates at `cap`, so the delay
/// sequence is non-decreasing.
pub fn backoff_delay(attempt: i64, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
    let delay = base.saturating_mul(2u32.saturating_pow(exponent));
    delay.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(60);
    const CAP: Duration = Duration::from_secs(30 * 60);

    #[test]
    fn test_validate_scheduled_at_future() {
        assert!(validate_scheduled_at(1_000_100, 1_000_000).is_ok());
    }

    #[test]
    fn test_validate_scheduled_at_past_rejected() {
        let err = validate_scheduled_at(999_000, 1_000_000).unwrap_err();
        assert!(matches!(err, FanoutError::InvalidInput(_)));

        // "now" counts as past: dispatch happens at or after the instant
        assert!(validate_scheduled_at(1_000_000, 1_000_000).is_err());
    }

    #[test]
    fn test_normalize_cron_five_fields() {
        let normalized = normalize_cron("*/5 * * * *").unwrap();
        assert_eq!(normalized, "0 */5 * * * *");
    }

    #[test]
    fn test_normalize_cron_six_fields_passthrough() {
        let normalized = normalize_cron("0 0 9 * * *").unwrap();
        assert_eq!(normalized, "0 0 9 * * *");
    }

    #[test]
    fn test_normalize_cron_invalid() {
        assert!(normalize_cron("not a cron").is_err());
        assert!(normalize_cron("").is_err());
        assert!(normalize_cron("99 * * * *").is_err());
    }

    #[test]
    fn test_next_occurrence_hourly() {
        // 2030-01-01 00:00:00 UTC
        let after = 1_893_456_000;
        let next = next_occurrence("0 * * * *", after).unwrap().unwrap();
        assert!(next > after);
        assert_eq!(next % 3600, 0, "hourly schedule lands on the hour");
        assert!(next - after <= 3600);
    }

    #[test]
    fn test_next_occurrence_strictly_after() {
        let after = 1_893_456_000; // exactly on the hour
        let next = next_occurrence("0 * * * *", after).unwrap().unwrap();
        assert_eq!(next, after + 3600);
    }

    #[test]
    fn test_next_occurrence_invalid_expression() {
        assert!(next_occurrence("bogus", 1_893_456_000).is_err());
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        assert_eq!(backoff_delay(1, BASE, CAP), Duration::from_secs(60));
        assert_eq!(backoff_delay(2, BASE, CAP), Duration::from_secs(120));
        assert_eq!(backoff_delay(3, BASE, CAP), Duration::from_secs(240));
        assert_eq!(backoff_delay(4, BASE, CAP), Duration::from_secs(480));
    }

    #[test]
    fn test_backoff_caps_at_thirty_minutes() {
        assert_eq!(backoff_delay(6, BASE, CAP), CAP);
        assert_eq!(backoff_delay(40, BASE, CAP), CAP);
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = backoff_delay(attempt, BASE, CAP);
            assert!(delay >= last, "delay shrank at attempt {}", attempt);
            last = delay;
        }
    }

    #[test]
    fn test_backoff_zero_attempts() {
        assert_eq!(backoff_delay(0, BASE, CAP), BASE);
    }
}
