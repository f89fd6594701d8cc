//! Guarded invocation: deadline + retry with backoff + circuit breaker.

use std::sync::mpsc;
use std::time::Duration;

use rand::Rng;
use vigil_types::Timestamp;

use crate::breaker::CircuitBreaker;
use crate::AgentError;

/// Retry tuning.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-indexed): exponential with
    /// full jitter, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base_delay_ms
            .saturating_mul(1 << attempt.min(16))
            .min(self.max_delay_ms);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Wraps a fallible call with the three protections every agent
/// invocation gets: circuit breaker, per-call deadline, bounded retries
/// with exponential backoff and jitter.
pub struct InvocationGuard {
    pub retry: RetryPolicy,
    pub deadline_ms: u64,
}

impl InvocationGuard {
    pub fn new(retry: RetryPolicy, deadline_ms: u64) -> Self {
        Self { retry, deadline_ms }
    }

    /// Runs `call` under the guard. The breaker is consulted once per
    /// attempt; timeouts and failures feed back into it.
    ///
    /// The call runs on a helper thread so the deadline can actually cut
    /// it off; a timed-out call's late result is discarded.
    pub fn invoke<R, F>(
        &self,
        breaker: &mut CircuitBreaker,
        now: Timestamp,
        call: F,
    ) -> Result<R, AgentError>
    where
        R: Send + 'static,
        F: Fn() -> Result<R, AgentError> + Send + Clone + 'static,
    {
        let mut last_error = AgentError::Failed("no attempts made".to_string());

        for attempt in 1..=self.retry.max_attempts {
            breaker.check(now)?;

            match self.attempt_once(call.clone()) {
                Ok(result) => {
                    breaker.record_success(now);
                    return Ok(result);
                }
                Err(error) => {
                    breaker.record_failure(now);
                    tracing::debug!(attempt, error = %error, "guarded call failed");
                    last_error = error;
                    if attempt < self.retry.max_attempts {
                        std::thread::sleep(self.retry.delay_for(attempt));
                    }
                }
            }
        }
        Err(last_error)
    }

    fn attempt_once<R, F>(&self, call: F) -> Result<R, AgentError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, AgentError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            // The receiver may be gone if the deadline already fired
            let _ = tx.send(call());
        });
        match rx.recv_timeout(Duration::from_millis(self.deadline_ms)) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(AgentError::Timeout {
                elapsed_ms: self.deadline_ms,
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(AgentError::Failed("call thread panicked".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn guard(attempts: u32, deadline_ms: u64) -> InvocationGuard {
        InvocationGuard::new(
            RetryPolicy {
                max_attempts: attempts,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            deadline_ms,
        )
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default())
    }

    #[test]
    fn success_passes_through() {
        let mut b = breaker();
        let result = guard(3, 1_000).invoke(&mut b, Timestamp::EPOCH, || Ok(42u32));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn retries_until_success() {
        let mut b = breaker();
        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);
        let result = guard(3, 1_000).invoke(&mut b, Timestamp::EPOCH, move || {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AgentError::Failed("transient".to_string()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_retries_surface_last_error() {
        let mut b = breaker();
        let result: Result<(), _> = guard(2, 1_000).invoke(&mut b, Timestamp::EPOCH, || {
            Err(AgentError::Failed("always".to_string()))
        });
        assert_eq!(result.unwrap_err(), AgentError::Failed("always".to_string()));
    }

    #[test]
    fn deadline_cuts_off_slow_calls() {
        let mut b = breaker();
        let result: Result<(), _> = guard(1, 20).invoke(&mut b, Timestamp::EPOCH, || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert!(matches!(result, Err(AgentError::Timeout { .. })));
    }

    #[test]
    fn open_breaker_short_circuits_without_calling() {
        let mut b = CircuitBreaker::new(BreakerConfig {
            min_samples: 1,
            failure_threshold: 0.5,
            cooldown_ms: 60_000,
            window_ms: 60_000,
        });
        b.record_failure(Timestamp::from_millis(1));

        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);
        let result: Result<(), _> =
            guard(3, 1_000).invoke(&mut b, Timestamp::from_millis(2), move || {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        assert!(matches!(result, Err(AgentError::CircuitOpen { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
