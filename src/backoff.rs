//! Reconnection policy: capped exponential backoff.
//!
//! The policy state machine is
//! `Idle → Connecting → Connected → Waiting → Connecting → ...`, ending in
//! `GivenUp` once the attempt cap is spent. Only a manual reconnect leaves
//! `GivenUp`.

use serde::Serialize;
use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling on any single delay
    pub max_delay: Duration,
    /// Retries allowed after the initial attempt
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (1-indexed):
    /// `min(base_delay * 2^(attempt-1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Where the reconnection policy currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyPhase {
    Idle,
    Connecting,
    Connected,
    Waiting,
    GivenUp,
}

impl std::fmt::Display for PolicyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyPhase::Idle => "idle",
            PolicyPhase::Connecting => "connecting",
            PolicyPhase::Connected => "connected",
            PolicyPhase::Waiting => "waiting",
            PolicyPhase::GivenUp => "given-up",
        };
        f.write_str(s)
    }
}

/// Attempt bookkeeping for one manager.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Retries scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Consume one attempt and return its delay, or `None` once the cap is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16_000));
    }

    #[test]
    fn test_delay_plateaus_at_max() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_delay_never_decreases() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(700),
            max_delay: Duration::from_millis(9_000),
            max_attempts: 64,
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "attempt {} went from {:?} to {:?}", attempt, previous, delay);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn test_attempt_zero_is_treated_as_first() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), policy.base_delay);
    }

    #[test]
    fn test_backoff_exhausts_after_cap() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays.len(), 5);
        assert_eq!(backoff.attempts(), 5);
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_backoff_reset_restarts_sequence() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn test_policy_phase_display() {
        assert_eq!(PolicyPhase::GivenUp.to_string(), "given-up");
        assert_eq!(PolicyPhase::Waiting.to_string(), "waiting");
    }
}
