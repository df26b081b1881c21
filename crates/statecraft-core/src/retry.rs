//! Retrier/catcher matching and backoff arithmetic.
//!
//! Error names are matched in list order; `States.ALL` is the wildcard but
//! deliberately does not cover `States.Timeout` unless the timeout name is
//! listed explicitly or the wildcard entry is the only one in its list.

use std::time::Duration;

use statecraft_types::error::{ERROR_ALL, ERROR_TIMEOUT};
use statecraft_types::machine::{Catcher, Retrier};

/// Backoff growth is unbounded in the definition; cap the computed sleep so
/// a hot `BackoffRate` cannot overflow `Duration`.
const MAX_BACKOFF: Duration = Duration::from_secs(86_400);

/// Whether an `ErrorEquals` list matches `error_name`. `sole_entry` says the
/// owning retrier/catcher is the only one in its list, which widens
/// `States.ALL` to cover `States.Timeout` as well.
pub fn error_matches(patterns: &[String], error_name: &str, sole_entry: bool) -> bool {
    let timeout_listed = patterns.iter().any(|p| p == ERROR_TIMEOUT);
    patterns.iter().any(|pattern| {
        pattern == error_name
            || (pattern == ERROR_ALL
                && (error_name != ERROR_TIMEOUT || timeout_listed || sole_entry))
    })
}

/// Find the first retrier matching `error_name`, with its index (attempt
/// budgets are tracked per retrier).
pub fn find_retrier<'a>(
    retriers: &'a [Retrier],
    error_name: &str,
) -> Option<(usize, &'a Retrier)> {
    let sole_entry = retriers.len() == 1;
    retriers
        .iter()
        .enumerate()
        .find(|(_, retrier)| error_matches(&retrier.error_equals, error_name, sole_entry))
}

/// Find the first catcher matching `error_name`.
pub fn find_catcher<'a>(catchers: &'a [Catcher], error_name: &str) -> Option<&'a Catcher> {
    let sole_entry = catchers.len() == 1;
    catchers
        .iter()
        .find(|catcher| error_matches(&catcher.error_equals, error_name, sole_entry))
}

/// Delay before the kth retry (1-based): `IntervalSeconds * BackoffRate^(k-1)`.
pub fn backoff_delay(retrier: &Retrier, retry_number: u32) -> Duration {
    let exponent = retry_number.saturating_sub(1);
    let seconds =
        retrier.interval_seconds as f64 * retrier.backoff_rate.powi(exponent as i32);
    if !seconds.is_finite() || seconds >= MAX_BACKOFF.as_secs_f64() {
        return MAX_BACKOFF;
    }
    Duration::from_secs_f64(seconds.max(0.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn retrier(spec: serde_json::Value) -> Retrier {
        serde_json::from_value(spec).unwrap()
    }

    fn catcher(spec: serde_json::Value) -> Catcher {
        serde_json::from_value(spec).unwrap()
    }

    // -----------------------------------------------------------------------
    // Name matching
    // -----------------------------------------------------------------------

    #[test]
    fn test_exact_name_match() {
        assert!(error_matches(&["E".to_string()], "E", false));
        assert!(!error_matches(&["E".to_string()], "F", false));
    }

    #[test]
    fn test_all_matches_ordinary_errors() {
        let patterns = vec![ERROR_ALL.to_string()];
        assert!(error_matches(&patterns, "Custom.Error", false));
        assert!(error_matches(&patterns, "States.TaskFailed", false));
    }

    #[test]
    fn test_all_excludes_timeout_by_default() {
        let patterns = vec![ERROR_ALL.to_string()];
        assert!(!error_matches(&patterns, ERROR_TIMEOUT, false));
    }

    #[test]
    fn test_all_covers_timeout_when_sole_entry() {
        let patterns = vec![ERROR_ALL.to_string()];
        assert!(error_matches(&patterns, ERROR_TIMEOUT, true));
    }

    #[test]
    fn test_all_covers_timeout_when_listed_explicitly() {
        let patterns = vec![ERROR_TIMEOUT.to_string(), ERROR_ALL.to_string()];
        assert!(error_matches(&patterns, ERROR_TIMEOUT, false));
    }

    // -----------------------------------------------------------------------
    // Retrier / catcher selection
    // -----------------------------------------------------------------------

    #[test]
    fn test_first_matching_retrier_wins() {
        let retriers = vec![
            retrier(json!({ "ErrorEquals": ["A"] })),
            retrier(json!({ "ErrorEquals": ["B"] })),
            retrier(json!({ "ErrorEquals": ["B", "C"] })),
        ];
        let (index, _) = find_retrier(&retriers, "B").unwrap();
        assert_eq!(index, 1);
        assert!(find_retrier(&retriers, "Z").is_none());
    }

    #[test]
    fn test_wildcard_retrier_skips_timeout_when_not_sole() {
        let retriers = vec![
            retrier(json!({ "ErrorEquals": ["States.ALL"] })),
            retrier(json!({ "ErrorEquals": ["X"] })),
        ];
        assert!(find_retrier(&retriers, ERROR_TIMEOUT).is_none());

        let sole = vec![retrier(json!({ "ErrorEquals": ["States.ALL"] }))];
        assert!(find_retrier(&sole, ERROR_TIMEOUT).is_some());
    }

    #[test]
    fn test_catcher_selection_in_order() {
        let catchers = vec![
            catcher(json!({ "ErrorEquals": ["E"], "Next": "OnE" })),
            catcher(json!({ "ErrorEquals": ["States.ALL"], "Next": "Fallback" })),
        ];
        assert_eq!(find_catcher(&catchers, "E").unwrap().next, "OnE");
        assert_eq!(find_catcher(&catchers, "Other").unwrap().next, "Fallback");
    }

    // -----------------------------------------------------------------------
    // Backoff arithmetic
    // -----------------------------------------------------------------------

    #[test]
    fn test_backoff_sequence() {
        let r = retrier(json!({
            "ErrorEquals": ["E"],
            "IntervalSeconds": 2,
            "BackoffRate": 3.0,
            "MaxAttempts": 4
        }));
        assert_eq!(backoff_delay(&r, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&r, 2), Duration::from_secs(6));
        assert_eq!(backoff_delay(&r, 3), Duration::from_secs(18));
        assert_eq!(backoff_delay(&r, 4), Duration::from_secs(54));
    }

    #[test]
    fn test_backoff_defaults() {
        let r = retrier(json!({ "ErrorEquals": ["E"] }));
        assert_eq!(backoff_delay(&r, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&r, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&r, 3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_zero_interval_is_zero() {
        let r = retrier(json!({ "ErrorEquals": ["E"], "IntervalSeconds": 0 }));
        assert_eq!(backoff_delay(&r, 3), Duration::ZERO);
    }

    #[test]
    fn test_backoff_is_capped() {
        let r = retrier(json!({
            "ErrorEquals": ["E"],
            "IntervalSeconds": 10,
            "BackoffRate": 10.0
        }));
        assert_eq!(backoff_delay(&r, 500), MAX_BACKOFF);
    }
}
