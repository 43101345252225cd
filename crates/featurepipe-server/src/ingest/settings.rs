//! Server-wide pipeline tuning, shared by every job

use crate::ingest::projection::Crs;
use std::time::Duration;

/// Default number of attempts per page (first try included)
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 4;

/// Default delay before the first retry
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default ceiling on a single retry delay
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default number of batches between fetch start and load commit
pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

/// Default concurrent attachment transfers per batch
pub const DEFAULT_ATTACHMENT_CONCURRENCY: usize = 8;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): base * 2^(attempt-1),
    /// capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_FETCH_ATTEMPTS,
            base_delay: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_BACKOFF_MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Assumed when a layer declares no spatial reference
    pub default_crs: Crs,
    pub retry: RetryPolicy,
    pub max_in_flight: usize,
    pub attachment_concurrency: usize,
    pub job_timeout: Option<Duration>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_crs: Crs::WGS84,
            retry: RetryPolicy::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            attachment_concurrency: DEFAULT_ATTACHMENT_CONCURRENCY,
            job_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(64), Duration::from_secs(1));
    }

    #[test]
    fn test_defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.max_in_flight, 2);
        assert_eq!(settings.default_crs, Crs::WGS84);
        assert!(settings.job_timeout.is_none());
    }
}
