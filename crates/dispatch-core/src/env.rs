//! Environment variable utilities
//!
//! Small typed readers used by `RuntimeConfig::from_env()`. A variable that
//! is unset or fails to parse falls back to the supplied default.
//!
//! ```ignore
//! use dispatch_core::env::{env_or, env_millis};
//!
//! let workers: usize = env_or("DISPATCH_NUM_WORKERS", 4);
//! let idle = env_millis("DISPATCH_IDLE_TIMEOUT_MS", 5000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well formed
#[inline]
pub fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean switch
///
/// "1", "true", "yes" and "on" (any case) read as true, "0", "false", "no"
/// and "off" as false. Anything else keeps the default.
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Duration given in whole milliseconds
pub fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(key, default_ms))
}

/// Duration given in whole microseconds
pub fn env_micros(key: &str, default_us: u64) -> Duration {
    Duration::from_micros(env_or(key, default_us))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_default() {
        let v: usize = env_or("DISPATCH_TEST_SURELY_UNSET_12345", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_env_or_parse() {
        std::env::set_var("DISPATCH_TEST_ENV_OR", " 17 ");
        let v: u32 = env_or("DISPATCH_TEST_ENV_OR", 0);
        assert_eq!(v, 17);
        std::env::remove_var("DISPATCH_TEST_ENV_OR");
    }

    #[test]
    fn test_env_or_bad_value_keeps_default() {
        std::env::set_var("DISPATCH_TEST_ENV_BAD", "not-a-number");
        let v: u64 = env_or("DISPATCH_TEST_ENV_BAD", 9);
        assert_eq!(v, 9);
        std::env::remove_var("DISPATCH_TEST_ENV_BAD");
    }

    #[test]
    fn test_env_flag() {
        std::env::set_var("DISPATCH_TEST_FLAG_ON", "Yes");
        std::env::set_var("DISPATCH_TEST_FLAG_OFF", "off");
        std::env::set_var("DISPATCH_TEST_FLAG_JUNK", "maybe");
        assert!(env_flag("DISPATCH_TEST_FLAG_ON", false));
        assert!(!env_flag("DISPATCH_TEST_FLAG_OFF", true));
        assert!(env_flag("DISPATCH_TEST_FLAG_JUNK", true));
        assert!(!env_flag("DISPATCH_TEST_FLAG_UNSET_999", false));
        std::env::remove_var("DISPATCH_TEST_FLAG_ON");
        std::env::remove_var("DISPATCH_TEST_FLAG_OFF");
        std::env::remove_var("DISPATCH_TEST_FLAG_JUNK");
    }

    #[test]
    fn test_env_durations() {
        std::env::set_var("DISPATCH_TEST_MS", "250");
        assert_eq!(env_millis("DISPATCH_TEST_MS", 1), Duration::from_millis(250));
        assert_eq!(env_micros("DISPATCH_TEST_US_UNSET", 7), Duration::from_micros(7));
        std::env::remove_var("DISPATCH_TEST_MS");
    }
}
