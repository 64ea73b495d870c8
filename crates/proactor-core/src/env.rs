//! Environment overrides for configuration.
//!
//! Every knob the proactor reads from the environment goes through these
//! helpers, so an unset or malformed variable always falls back to the
//! compiled-in default instead of failing.
//!
//! ```ignore
//! use proactor_core::env::{env_get, env_get_bool};
//!
//! let timeout_ms: u64 = env_get("PROACTOR_POLL_TIMEOUT_MS", 500);
//! let flush = env_get_bool("PROACTOR_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or `default` when unset or unparsable.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// `Some` only when `key` is set and parses.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" (any case) are true; any other value is false.
/// Unset returns `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Raw string value, or `default` when unset.
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Millisecond count as a `Duration`.
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map(Duration::from_millis).unwrap_or(default)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; tests run in parallel.

    #[test]
    fn test_unset_falls_back() {
        let n: usize = env_get("__PROACTOR_TEST_UNSET__", 64);
        assert_eq!(n, 64);
        assert!(env_get_opt::<u16>("__PROACTOR_TEST_UNSET__").is_none());
        assert!(env_get_bool("__PROACTOR_TEST_UNSET__", true));
        assert_eq!(env_get_str("__PROACTOR_TEST_UNSET__", "loop"), "loop");
    }

    #[test]
    fn test_parse_and_trim() {
        std::env::set_var("__PROACTOR_TEST_NUM__", " 4096 ");
        let n: usize = env_get("__PROACTOR_TEST_NUM__", 0);
        assert_eq!(n, 4096);
        std::env::remove_var("__PROACTOR_TEST_NUM__");
    }

    #[test]
    fn test_malformed_uses_default() {
        std::env::set_var("__PROACTOR_TEST_BAD__", "lots");
        let n: u32 = env_get("__PROACTOR_TEST_BAD__", 128);
        assert_eq!(n, 128);
        std::env::remove_var("__PROACTOR_TEST_BAD__");
    }

    #[test]
    fn test_bool_values() {
        for v in ["1", "TRUE", "yes", "On"] {
            std::env::set_var("__PROACTOR_TEST_BOOL__", v);
            assert!(env_get_bool("__PROACTOR_TEST_BOOL__", false), "{v}");
        }
        for v in ["0", "false", "nope"] {
            std::env::set_var("__PROACTOR_TEST_BOOL__", v);
            assert!(!env_get_bool("__PROACTOR_TEST_BOOL__", true), "{v}");
        }
        std::env::remove_var("__PROACTOR_TEST_BOOL__");
    }

    #[test]
    fn test_millis() {
        std::env::set_var("__PROACTOR_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__PROACTOR_TEST_MS__", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        std::env::remove_var("__PROACTOR_TEST_MS__");
        assert_eq!(
            env_get_millis("__PROACTOR_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
