use std::time::Duration;

use rand::Rng as _;

use crate::classify::{ErrorCode, NormalizedError};
use crate::errors::WrapperError;

/// Retry configuration, immutable per wrapper instance.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt. `0` disables retry.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Adds up to 25% random extra wait on top of the backoff.
    pub jitter_enabled: bool,
    /// Codes eligible for retry (in addition to being transient).
    pub retryable_codes: Vec<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_enabled: true,
            retryable_codes: vec![ErrorCode::Overloaded, ErrorCode::RateLimited],
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn disabled() -> Self {
        Self::default().max_retries(0)
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Replaces the set of retryable codes.
    pub fn retryable_codes(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.retryable_codes = codes.into_iter().collect();
        self
    }

    /// Checks that the policy can produce sane delays.
    pub fn validate(&self) -> Result<(), WrapperError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(WrapperError::Config(format!(
                "retry multiplier must be a finite value >= 1.0 (got {})",
                self.multiplier
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(WrapperError::Config(format!(
                "retry base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Per-session retry progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
    /// `0` during the initial attempt; incremented once per retry.
    pub attempt_number: u32,
}

/// Decides whether and how long to wait before a fresh upstream attempt.
#[derive(Clone, Debug)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// True only for transient, retryable errors while retries remain.
    pub fn should_retry(&self, state: &RetryState, err: &NormalizedError) -> bool {
        err.is_transient
            && self.policy.retryable_codes.contains(&err.code)
            && state.attempt_number < self.policy.max_retries
    }

    /// Exponential backoff for the current attempt, capped at `max_delay`,
    /// without jitter.
    pub fn backoff_delay(&self, state: &RetryState) -> Duration {
        if self.policy.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(state.attempt_number).unwrap_or(i32::MAX);
        let scaled = self.policy.base_delay.as_secs_f64() * self.policy.multiplier.powi(exponent);
        let capped = scaled.min(self.policy.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.policy.max_delay)
    }

    /// Backoff plus optional jitter in `[0, delay / 4]`. Does not mutate `state`.
    pub fn compute_delay(&self, state: &RetryState) -> Duration {
        let delay = self.backoff_delay(state);
        if !self.policy.jitter_enabled || delay.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=delay.as_secs_f64() * 0.25);
        delay + Duration::from_secs_f64(extra)
    }

    pub fn record_attempt(&self, state: &mut RetryState) {
        state.attempt_number = state.attempt_number.saturating_add(1);
    }

    pub fn reset(&self, state: &mut RetryState) {
        state.attempt_number = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overloaded() -> NormalizedError {
        NormalizedError::for_code(ErrorCode::Overloaded, "503")
    }

    #[test]
    fn defaults_match_documented_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(policy.jitter_enabled);
        assert_eq!(
            policy.retryable_codes,
            vec![ErrorCode::Overloaded, ErrorCode::RateLimited]
        );
    }

    #[test]
    fn retries_until_budget_is_spent() {
        let controller = RetryController::new(RetryPolicy::default());
        let mut state = RetryState::default();
        assert!(controller.should_retry(&state, &overloaded()));
        controller.record_attempt(&mut state);
        assert!(controller.should_retry(&state, &overloaded()));
        controller.record_attempt(&mut state);
        assert!(!controller.should_retry(&state, &overloaded()));
        controller.reset(&mut state);
        assert_eq!(state.attempt_number, 0);
    }

    #[test]
    fn zero_max_retries_never_retries() {
        let controller = RetryController::new(RetryPolicy::disabled());
        let rate_limited = NormalizedError::for_code(ErrorCode::RateLimited, "429");
        assert!(!controller.should_retry(&RetryState::default(), &rate_limited));
    }

    #[test]
    fn non_transient_or_unlisted_codes_are_not_retried() {
        let controller = RetryController::new(RetryPolicy::default());
        let state = RetryState::default();
        let timeout = NormalizedError::for_code(ErrorCode::Timeout, "timeout");
        assert!(!controller.should_retry(&state, &timeout));
        // transient, but not in the default retryable set
        assert!(!controller.should_retry(&state, &NormalizedError::terminated()));

        let controller = RetryController::new(
            RetryPolicy::default().retryable_codes([ErrorCode::Terminated]),
        );
        assert!(controller.should_retry(&state, &NormalizedError::terminated()));
        assert!(!controller.should_retry(&state, &overloaded()));
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let controller = RetryController::new(
            RetryPolicy::default()
                .base_delay(Duration::from_secs(2))
                .max_delay(Duration::from_secs(30))
                .jitter(false),
        );
        let mut state = RetryState::default();
        let mut previous = Duration::ZERO;
        let mut delays = Vec::new();
        for _ in 0..8 {
            let delay = controller.compute_delay(&state);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            delays.push(delay.as_secs());
            previous = delay;
            controller.record_attempt(&mut state);
        }
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30, 30]);
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_delay() {
        let controller = RetryController::new(RetryPolicy::default().jitter(true));
        let state = RetryState { attempt_number: 1 };
        for _ in 0..100 {
            let delay = controller.compute_delay(&state);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(5));
        }
        assert_eq!(state.attempt_number, 1);
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_max_delay() {
        let controller = RetryController::new(RetryPolicy::default().jitter(false));
        let state = RetryState {
            attempt_number: u32::MAX,
        };
        assert_eq!(controller.compute_delay(&state), Duration::from_secs(30));
    }

    #[test]
    fn validate_rejects_bad_multiplier_and_inverted_delays() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().multiplier(0.5).validate().is_err());
        assert!(RetryPolicy::default().multiplier(f64::NAN).validate().is_err());
        assert!(
            RetryPolicy::default()
                .base_delay(Duration::from_secs(60))
                .validate()
                .is_err()
        );
    }
}
