//! Retry policy for upstream requests
//!
//! The request loop in [`super::http_client`] asks a [`RetryPolicy`] two
//! questions after every attempt: should this be retried, and how long to wait
//! first. [`QuotaAwarePolicy`] answers with exponential backoff for transient
//! failures and quota-aligned waits for 429 responses.

use std::time::Duration;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::SyncError;
use crate::sync::quota::QuotaSnapshot;

/// What a single attempt produced
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// A response arrived with this status
    Response { status: u16, retry_after: Option<u64> },
    /// The request never produced a response
    Transport(SyncError),
}

impl AttemptOutcome {
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptOutcome::Response { status, .. } => Some(*status),
            AttemptOutcome::Transport(_) => None,
        }
    }
}

/// Decision taken after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait and send the request again
    Retry,
    /// Hand the outcome to the caller as-is
    Stop,
    /// Shutdown was signalled; abandon the request
    Cancel,
}

/// Strategy deciding whether and when to retry
#[cfg_attr(test, mockall::automock)]
pub trait RetryPolicy: Send + Sync {
    /// Classify an attempt outcome
    fn classify(&self, outcome: &AttemptOutcome, cancelled: bool) -> RetryDecision;

    /// Wait before retry number `attempt` (0-based)
    fn backoff(&self, attempt: u32, outcome: &AttemptOutcome, quota: &QuotaSnapshot) -> Duration;

    /// Retries allowed after the first attempt
    fn max_retries(&self) -> u32;
}

/// Default policy: retry transport failures, 429 and 5xx
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaAwarePolicy {
    max_retries: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl Default for QuotaAwarePolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl QuotaAwarePolicy {
    pub fn new(max_retries: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            min_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.min_backoff(), config.max_backoff())
    }

    /// `min * 2^attempt`, capped at the maximum
    pub fn exponential_backoff(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.min_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |wait| wait.min(self.max_backoff))
    }
}

impl RetryPolicy for QuotaAwarePolicy {
    fn classify(&self, outcome: &AttemptOutcome, cancelled: bool) -> RetryDecision {
        if cancelled {
            return RetryDecision::Cancel;
        }

        match outcome {
            AttemptOutcome::Transport(SyncError::Cancelled) => RetryDecision::Cancel,
            AttemptOutcome::Transport(_) => RetryDecision::Retry,
            AttemptOutcome::Response { status, .. } => match *status {
                // Entitlement missing; retrying cannot help
                402 => RetryDecision::Stop,
                404 => RetryDecision::Stop,
                429 => RetryDecision::Retry,
                s if s >= 500 => RetryDecision::Retry,
                _ => RetryDecision::Stop,
            },
        }
    }

    fn backoff(&self, attempt: u32, outcome: &AttemptOutcome, quota: &QuotaSnapshot) -> Duration {
        if let AttemptOutcome::Response {
            status: 429,
            retry_after,
        } = outcome
        {
            return match retry_after {
                Some(secs) => {
                    debug!(attempt, wait_secs = secs, "Rate limited, honoring Retry-After");
                    Duration::from_secs(*secs)
                }
                None => {
                    debug!(
                        attempt,
                        wait_ms = quota.time_until_short_reset.as_millis() as u64,
                        "Rate limited, waiting for 15-minute window reset"
                    );
                    quota.time_until_short_reset
                }
            };
        }

        self.exponential_backoff(attempt)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Bookkeeping for one logical request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Retries performed so far
    pub attempt: u32,
    pub last_decision: Option<RetryDecision>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, decision: RetryDecision) {
        self.last_decision = Some(decision);
    }

    /// True once no retries remain
    pub fn exhausted(&self, max_retries: u32) -> bool {
        self.attempt >= max_retries
    }

    pub fn advance(&mut self) {
        self.attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn response(status: u16) -> AttemptOutcome {
        AttemptOutcome::Response {
            status,
            retry_after: None,
        }
    }

    fn policy() -> QuotaAwarePolicy {
        QuotaAwarePolicy::new(5, Duration::from_secs(1), Duration::from_secs(300))
    }

    // Test 1: Status classification
    #[test]
    fn test_classify_statuses() {
        let p = policy();

        assert_eq!(p.classify(&response(200), false), RetryDecision::Stop);
        assert_eq!(p.classify(&response(400), false), RetryDecision::Stop);
        assert_eq!(p.classify(&response(401), false), RetryDecision::Stop);
        assert_eq!(p.classify(&response(402), false), RetryDecision::Stop);
        assert_eq!(p.classify(&response(404), false), RetryDecision::Stop);
        assert_eq!(p.classify(&response(429), false), RetryDecision::Retry);
        assert_eq!(p.classify(&response(500), false), RetryDecision::Retry);
        assert_eq!(p.classify(&response(503), false), RetryDecision::Retry);
    }

    // Test 2: Transport failures retry, cancellation wins over everything
    #[test]
    fn test_classify_transport_and_cancel() {
        let p = policy();

        assert_eq!(
            p.classify(&AttemptOutcome::Transport(SyncError::ConnectionRefused), false),
            RetryDecision::Retry
        );
        assert_eq!(
            p.classify(&AttemptOutcome::Transport(SyncError::NetworkTimeout), false),
            RetryDecision::Retry
        );
        assert_eq!(
            p.classify(&AttemptOutcome::Transport(SyncError::Cancelled), false),
            RetryDecision::Cancel
        );
        assert_eq!(p.classify(&response(503), true), RetryDecision::Cancel);
        assert_eq!(p.classify(&response(200), true), RetryDecision::Cancel);
    }

    // Test 3: Exponential backoff doubles and caps
    #[test]
    fn test_exponential_backoff() {
        let p = QuotaAwarePolicy::new(10, Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(p.exponential_backoff(0), Duration::from_secs(1));
        assert_eq!(p.exponential_backoff(1), Duration::from_secs(2));
        assert_eq!(p.exponential_backoff(3), Duration::from_secs(8));
        assert_eq!(p.exponential_backoff(6), Duration::from_secs(60));
        assert_eq!(p.exponential_backoff(40), Duration::from_secs(60));
    }

    // Test 4: 429 honors Retry-After, else waits for the short window
    #[test]
    fn test_backoff_rate_limited() {
        let p = policy();
        let quota = QuotaSnapshot::unknown(Utc.with_ymd_and_hms(2024, 1, 1, 9, 10, 0).unwrap());

        let with_header = AttemptOutcome::Response {
            status: 429,
            retry_after: Some(17),
        };
        assert_eq!(p.backoff(3, &with_header, &quota), Duration::from_secs(17));

        assert_eq!(
            p.backoff(0, &response(429), &quota),
            Duration::from_secs(5 * 60 + 2)
        );
    }

    // Test 5: Server errors use exponential backoff
    #[test]
    fn test_backoff_server_error() {
        let p = policy();
        let quota = QuotaSnapshot::unknown(Utc::now());

        assert_eq!(p.backoff(2, &response(502), &quota), Duration::from_secs(4));
        assert_eq!(
            p.backoff(1, &AttemptOutcome::Transport(SyncError::ConnectionRefused), &quota),
            Duration::from_secs(2)
        );
    }

    // Test 6: Defaults follow the retry config
    #[test]
    fn test_default_policy() {
        let p = QuotaAwarePolicy::default();

        assert_eq!(p.max_retries(), 5);
        assert_eq!(p.exponential_backoff(0), Duration::from_secs(1));
        assert_eq!(p.exponential_backoff(20), Duration::from_secs(300));
    }

    // Test 7: Retry state tracks attempts
    #[test]
    fn test_retry_state() {
        let mut state = RetryState::new();
        assert!(!state.exhausted(2));

        state.record(RetryDecision::Retry);
        state.advance();
        state.advance();

        assert!(state.exhausted(2));
        assert_eq!(state.last_decision, Some(RetryDecision::Retry));
        assert!(RetryState::new().exhausted(0));
    }
}
