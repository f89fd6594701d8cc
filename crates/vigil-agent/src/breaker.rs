//! Circuit breaker keyed by failure ratio over a sliding window.

use std::collections::VecDeque;

use vigil_types::Timestamp;

use crate::AgentError;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Sliding window over which the failure ratio is computed.
    pub window_ms: u64,
    /// Minimum samples in the window before the breaker may open.
    pub min_samples: usize,
    /// Failure ratio in `[0, 1]` at which the breaker opens.
    pub failure_threshold: f64,
    /// How long the breaker stays open before probing.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            min_samples: 5,
            failure_threshold: 0.5,
            cooldown_ms: 30_000,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-dependency circuit breaker.
///
/// Closed: calls pass, outcomes are recorded. Open: calls short-circuit
/// with [`AgentError::CircuitOpen`] until the cooldown passes. Half-open:
/// one probe call is admitted; success closes the breaker, failure
/// reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    outcomes: VecDeque<(Timestamp, bool)>,
    opened_at: Option<Timestamp>,
    probing: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            outcomes: VecDeque::new(),
            opened_at: None,
            probing: false,
        }
    }

    pub fn state(&self, now: Timestamp) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(opened) if now.millis_since(opened) >= self.config.cooldown_ms => {
                BreakerState::HalfOpen
            }
            Some(_) => BreakerState::Open,
        }
    }

    /// Gate for one call. `Err` means short-circuit without invoking the
    /// dependency.
    pub fn check(&mut self, now: Timestamp) -> Result<(), AgentError> {
        match self.state(now) {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if self.probing {
                    // Only one probe in flight at a time
                    Err(AgentError::CircuitOpen {
                        cooldown_remaining_ms: 0,
                    })
                } else {
                    self.probing = true;
                    Ok(())
                }
            }
            BreakerState::Open => {
                let opened = self.opened_at.expect("open implies opened_at");
                let remaining = self
                    .config
                    .cooldown_ms
                    .saturating_sub(now.millis_since(opened));
                Err(AgentError::CircuitOpen {
                    cooldown_remaining_ms: remaining,
                })
            }
        }
    }

    pub fn record_success(&mut self, now: Timestamp) {
        if self.opened_at.is_some() {
            // Probe succeeded: close and start fresh
            self.opened_at = None;
            self.probing = false;
            self.outcomes.clear();
            return;
        }
        self.push_outcome(now, true);
    }

    pub fn record_failure(&mut self, now: Timestamp) {
        if self.opened_at.is_some() {
            // Probe failed: reopen for another cooldown
            self.opened_at = Some(now);
            self.probing = false;
            return;
        }
        self.push_outcome(now, false);
        if self.should_open() {
            tracing::warn!(
                failures = self.failure_count(),
                samples = self.outcomes.len(),
                "circuit breaker opening"
            );
            self.opened_at = Some(now);
        }
    }

    /// Operator action: force the breaker closed.
    pub fn reset(&mut self) {
        self.opened_at = None;
        self.probing = false;
        self.outcomes.clear();
    }

    fn push_outcome(&mut self, now: Timestamp, success: bool) {
        self.outcomes.push_back((now, success));
        let cutoff = now.as_nanos().saturating_sub(self.config.window_ms * 1_000_000);
        while self
            .outcomes
            .front()
            .is_some_and(|(ts, _)| ts.as_nanos() < cutoff)
        {
            self.outcomes.pop_front();
        }
    }

    fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, success)| !success).count()
    }

    fn should_open(&self) -> bool {
        if self.outcomes.len() < self.config.min_samples {
            return false;
        }
        let ratio = self.failure_count() as f64 / self.outcomes.len() as f64;
        ratio >= self.config.failure_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            window_ms: 10_000,
            min_samples: 4,
            failure_threshold: 0.5,
            cooldown_ms: 1_000,
        })
    }

    #[test]
    fn stays_closed_below_threshold() {
        let mut b = breaker();
        for i in 0..10 {
            b.record_success(at(i));
        }
        b.record_failure(at(11));
        assert_eq!(b.state(at(12)), BreakerState::Closed);
        assert!(b.check(at(12)).is_ok());
    }

    #[test]
    fn opens_at_failure_ratio() {
        let mut b = breaker();
        b.record_success(at(1));
        b.record_failure(at(2));
        b.record_failure(at(3));
        b.record_failure(at(4)); // 3/4 failures
        assert_eq!(b.state(at(5)), BreakerState::Open);
        assert!(matches!(
            b.check(at(5)),
            Err(AgentError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let mut b = breaker();
        for i in 0..4 {
            b.record_failure(at(i));
        }
        assert_eq!(b.state(at(10)), BreakerState::Open);

        // Past the cooldown one probe is admitted
        assert!(b.check(at(1_500)).is_ok());
        // A second concurrent probe is not
        assert!(b.check(at(1_500)).is_err());

        b.record_success(at(1_600));
        assert_eq!(b.state(at(1_700)), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let mut b = breaker();
        for i in 0..4 {
            b.record_failure(at(i));
        }
        assert!(b.check(at(1_500)).is_ok());
        b.record_failure(at(1_600));
        assert_eq!(b.state(at(1_700)), BreakerState::Open);
        // New cooldown counts from the failed probe
        assert_eq!(b.state(at(2_700)), BreakerState::HalfOpen);
    }

    #[test]
    fn old_outcomes_age_out() {
        let mut b = breaker();
        for i in 0..4 {
            b.record_failure(at(i));
        }
        // breaker opened; reset and verify the window empties with time
        b.reset();
        b.record_failure(at(20_000));
        b.record_failure(at(20_001));
        b.record_failure(at(20_002));
        // Only 3 samples in window, below min_samples
        assert_eq!(b.state(at(20_003)), BreakerState::Closed);
    }
}
