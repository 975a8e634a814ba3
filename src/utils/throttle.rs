//! Log throttling utility
//!
//! Limits how often the same log message is recorded, so a flaky capture
//! device cannot flood the log with identical read errors.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Throttles repeated log messages by key.
///
/// # Example
///
/// ```rust
/// use camstream::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("read_error"));
/// assert!(!throttler.should_log("read_error"));
/// ```
pub struct LogThrottler {
    /// Map of message key to last log time
    last_logged: RwLock<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    /// Create a throttler with the interval in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check if a message should be logged (not throttled).
    ///
    /// Returns `true` if the message should be logged, `false` if it should
    /// be suppressed. When `true` is returned the internal timestamp is
    /// updated.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        {
            let map = self.last_logged.read();
            if let Some(last) = map.get(key) {
                if now.duration_since(*last) < self.interval {
                    return false;
                }
            }
        }

        let mut map = self.last_logged.write();
        // Double-check after acquiring write lock
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Clear throttle state for a key so the next error logs immediately.
    /// Call this when an error condition recovers.
    pub fn clear(&self, key: &str) {
        self.last_logged.write().remove(key);
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Macro for throttled warning logging
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Macro for throttled error logging
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::error!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_logs() {
        let throttler = LogThrottler::with_secs(1);
        assert!(throttler.should_log("key"));
    }

    #[test]
    fn test_throttling_window() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("key"));
        assert!(!throttler.should_log("key"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("key"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("read"));
        assert!(throttler.should_log("record"));
        assert!(!throttler.should_log("read"));
        assert!(!throttler.should_log("record"));
    }

    #[test]
    fn test_clear_resets_key() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key"));
        assert!(!throttler.should_log("key"));

        throttler.clear("key");
        assert!(throttler.should_log("key"));
    }
}
