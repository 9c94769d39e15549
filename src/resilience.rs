//! Resilience utilities: reconnect retry policy and attempt accounting.
//!
//! - [`RetryConfig`]: delay schedule between connection attempts
//! - [`ConnectStats`]: counts attempts, separating timeouts from other I/O
//!   failures for diagnostics
//!
//! The remote client never gives up on its own; only an external shutdown
//! request ends the retry loop.
//!
//! # Example
//!
//! ```rust
//! use replication_distributor::resilience::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::reconnect();
//! assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(retry.delay_for_attempt(50), Duration::from_secs(1));
//! assert!(retry.should_warn(10));
//! ```

use crate::config::RemoteClientConfig;
use crate::error::ReplicationError;
use std::time::Duration;

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the delay.
    pub max_delay: Duration,

    /// Backoff multiplier. 1.0 keeps the delay fixed.
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,

    /// Failed attempts are logged at warn level every `warn_every` attempts
    /// and at debug level otherwise. 0 warns on every attempt.
    pub warn_every: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::reconnect()
    }
}

impl RetryConfig {
    /// Fixed one second delay, forever.
    ///
    /// ```text
    /// Attempt  Delay   Log level
    /// -------  -----   ---------
    /// 1..9     1s      debug
    /// 10       1s      warn
    /// 11..19   1s      debug
    /// 20       1s      warn
    /// ```
    pub fn reconnect() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            backoff_factor: 1.0,
            connection_timeout: Duration::from_secs(5),
            warn_every: 10,
        }
    }

    /// Fast retry for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            backoff_factor: 1.0,
            connection_timeout: Duration::from_millis(500),
            warn_every: 10,
        }
    }

    /// Build from the client configuration section.
    pub fn from_client_config(config: &RemoteClientConfig) -> Self {
        let delay = config.retry_delay_duration();
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            connection_timeout: config.connect_timeout_duration(),
            warn_every: config.retry_warn_every,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u64) -> Duration {
        if attempt <= 1 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as u64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Whether a failed attempt should be logged at warn level.
    pub fn should_warn(&self, attempt: u64) -> bool {
        self.warn_every == 0 || attempt % self.warn_every == 0
    }
}

/// Connection attempt counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectStats {
    /// Total attempts, successful or not.
    pub attempts: u64,
    /// Attempts that timed out.
    pub timeouts: u64,
    /// Attempts that failed with any other I/O error.
    pub io_errors: u64,
    /// Attempts that reached a server but were skipped for role preference.
    pub role_mismatches: u64,
    /// Consecutive failures since the last successful connection.
    pub consecutive_failures: u64,
}

impl ConnectStats {
    /// Count a successful connection.
    pub fn record_success(&mut self) {
        self.attempts += 1;
        self.consecutive_failures = 0;
    }

    /// Count a failed attempt and return the metric outcome label.
    pub fn record_failure(&mut self, error: &ReplicationError) -> &'static str {
        self.attempts += 1;
        self.consecutive_failures += 1;
        if error.is_timeout() {
            self.timeouts += 1;
            "timeout"
        } else {
            self.io_errors += 1;
            "io_error"
        }
    }

    /// Count a server skipped because its role did not match.
    pub fn record_role_mismatch(&mut self) {
        self.attempts += 1;
        self.role_mismatches += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_is_fixed_one_second() {
        let config = RetryConfig::reconnect();
        for attempt in [0, 1, 2, 10, 1_000, u64::MAX] {
            assert_eq!(config.delay_for_attempt(attempt), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_delay_for_attempt_exponential() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
            warn_every: 10,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(5_000), Duration::from_secs(30));
    }

    #[test]
    fn test_should_warn_every_tenth() {
        let config = RetryConfig::reconnect();
        let warned: Vec<u64> = (1..=30).filter(|a| config.should_warn(*a)).collect();
        assert_eq!(warned, vec![10, 20, 30]);
    }

    #[test]
    fn test_should_warn_zero_warns_always() {
        let config = RetryConfig {
            warn_every: 0,
            ..RetryConfig::testing()
        };
        assert!(config.should_warn(1));
        assert!(config.should_warn(7));
    }

    #[test]
    fn test_from_client_config() {
        let client = RemoteClientConfig {
            retry_delay: "250ms".to_string(),
            connect_timeout: "2s".to_string(),
            retry_warn_every: 5,
            ..Default::default()
        };
        let config = RetryConfig::from_client_config(&client);
        assert_eq!(config.delay_for_attempt(7), Duration::from_millis(250));
        assert_eq!(config.connection_timeout, Duration::from_secs(2));
        assert!(config.should_warn(5));
        assert!(!config.should_warn(6));
    }

    #[test]
    fn test_connect_stats_separates_timeouts() {
        let mut stats = ConnectStats::default();
        let timeout = ReplicationError::timeout("connect", Duration::from_millis(5));
        let refused = ReplicationError::io_msg("connect", "connection refused");

        assert_eq!(stats.record_failure(&timeout), "timeout");
        assert_eq!(stats.record_failure(&refused), "io_error");
        assert_eq!(stats.record_failure(&refused), "io_error");
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.io_errors, 2);
        assert_eq!(stats.consecutive_failures, 3);

        stats.record_success();
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn test_connect_stats_role_mismatch() {
        let mut stats = ConnectStats::default();
        stats.record_role_mismatch();
        assert_eq!(stats.role_mismatches, 1);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.consecutive_failures, 0);
    }
}
