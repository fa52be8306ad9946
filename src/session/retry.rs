//! Retry Policy
//!
//! Bounded retries for client operations that failed before the cluster
//! accepted them.

use std::time::Duration;

use crate::config::RouterConfig;
use crate::error::Error;

/// Bounded retry policy with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

/// Progress of one retried operation
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts made so far
    pub attempt: u32,
    /// Leaders we were redirected to, in order
    pub redirects: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            ..Self::default()
        }
    }

    /// Record a failed attempt and decide whether to try again. Returns the
    /// delay before the next attempt, or `None` when the error must be
    /// surfaced.
    ///
    /// A redirect to a leader not seen before is followed immediately;
    /// everything else backs off.
    pub fn next_delay(&self, state: &mut RetryState, error: &Error) -> Option<Duration> {
        state.attempt += 1;
        if !error.is_retryable() || state.attempt >= self.max_attempts {
            return None;
        }

        if let Error::NotLeader { leader: Some(leader) } = error {
            let fresh = !state.redirects.contains(leader);
            state.redirects.push(leader.clone());
            if fresh {
                return Some(Duration::ZERO);
            }
        }

        Some(self.backoff(state.attempt))
    }

    /// Backoff before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(25),
        }
    }

    #[test]
    fn test_first_redirect_is_immediate() {
        let policy = policy();
        let mut state = RetryState::default();
        let redirect = Error::NotLeader { leader: Some("n2".into()) };

        assert_eq!(policy.next_delay(&mut state, &redirect), Some(Duration::ZERO));
        // Bounced back to the same leader: back off.
        assert_eq!(
            policy.next_delay(&mut state, &redirect),
            Some(Duration::from_millis(20))
        );
        assert_eq!(state.redirects, vec!["n2".to_string(), "n2".to_string()]);
    }

    #[test]
    fn test_backoff_is_capped_and_attempts_bounded() {
        let policy = policy();
        let mut state = RetryState::default();

        assert_eq!(policy.next_delay(&mut state, &Error::NoLeader), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(&mut state, &Error::NoLeader), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_delay(&mut state, &Error::NoLeader), Some(Duration::from_millis(25)));
        assert_eq!(policy.next_delay(&mut state, &Error::NoLeader), None);
    }

    #[test]
    fn test_ambiguous_failures_are_surfaced() {
        let policy = policy();
        let mut state = RetryState::default();

        assert_eq!(policy.next_delay(&mut state, &Error::Timeout("write".into())), None);
        assert_eq!(
            policy.next_delay(&mut state, &Error::ConnectionTimeout("127.0.0.1:1".into())),
            None
        );
    }
}
