//! Client-side tuning knobs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy of the recovery manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recovery attempts per producer before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt, doubled on every further attempt
    pub base_delay_ms: u64,
    /// Upper bound of any single delay
    pub max_delay_ms: u64,
    /// Random extra delay, as a fraction of the exponential delay
    pub jitter_ratio: f64,
    /// Pause between the transport health check and the new handshake
    pub stabilization_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_ratio: 0.3,
            stabilization_delay_ms: 200,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub const fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    /// Longest time a consume can take under this policy when every
    /// handshake runs into `request_timeout`: the first attempt, then every
    /// retry with full jitter and its stabilization pause
    #[must_use]
    pub fn worst_case_duration(&self, request_timeout: Duration) -> Duration {
        let max_delay = self.max_delay_ms as f64;
        let backoff_ms: f64 = (0..self.max_attempts)
            .map(|attempt| {
                let exponential = self.base_delay_ms as f64 * 2f64.powi(attempt.min(30) as i32);
                (exponential * (1.0 + self.jitter_ratio)).min(max_delay)
            })
            .sum();
        request_timeout * (self.max_attempts + 1)
            + Duration::from_millis(backoff_ms.ceil() as u64)
            + self.stabilization_delay() * self.max_attempts
    }

    /// Same policy without jitter, for deterministic schedules
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }
}

/// Timeouts of a media session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// One signaling round trip
    pub request_timeout_ms: u64,
    /// One whole consume operation, recovery included. Should leave room
    /// for [`RecoveryConfig::worst_case_duration`].
    pub operation_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            operation_timeout_ms: 60_000,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_case_duration() {
        let recovery = RecoveryConfig::default().without_jitter();
        // 4 handshakes, 1 + 2 + 4 s of backoff, 3 stabilization pauses
        assert_eq!(
            recovery.worst_case_duration(Duration::from_secs(10)),
            Duration::from_millis(47_600)
        );
    }

    #[test]
    fn test_default_operation_timeout_fits_retry_budget() {
        let session = SessionConfig::default();
        let budget = RecoveryConfig::default().worst_case_duration(session.request_timeout());
        assert!(session.operation_timeout() >= budget);
    }
}
