use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Failure threshold breached, requests are rejected
    Open,
    /// Letting trial calls through to see whether the provider recovered
    HalfOpen,
}

/// Stops hammering a provider that keeps failing.
///
/// Only failures the caller classifies as provider faults are counted, so a
/// request for an unknown symbol never opens the circuit for everyone else.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: usize,
    success_threshold: usize,
    cooldown: Duration,
    name: String,
}

struct BreakerState {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker [{name}] is open, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    /// # Arguments
    /// * `failure_threshold` - Consecutive provider faults before opening
    /// * `success_threshold` - Consecutive successes in HalfOpen before closing
    /// * `cooldown` - Time spent Open before a trial call is allowed
    pub fn new(
        name: impl Into<String>,
        failure_threshold: usize,
        success_threshold: usize,
        cooldown: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            cooldown,
            name: name.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("CircuitBreaker [{}]: state lock poisoned", self.name);
                poisoned.into_inner()
            }
        }
    }

    /// Runs `f` unless the circuit is open. Errors for which `is_fault`
    /// returns false pass through without affecting the circuit.
    pub async fn call<F, T, E>(
        &self,
        f: F,
        is_fault: impl Fn(&E) -> bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match f.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if is_fault(&e) {
                    self.on_failure();
                } else {
                    self.on_success();
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut state = self.lock();
        if state.state != CircuitState::Open {
            return Ok(());
        }
        let elapsed = state.opened_at.map_or(self.cooldown, |at| at.elapsed());
        if elapsed >= self.cooldown {
            info!("CircuitBreaker [{}]: cooldown over, letting a trial call through", self.name);
            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            Ok(())
        } else {
            Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_in: self.cooldown - elapsed,
            })
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.success_threshold {
                    info!(
                        "CircuitBreaker [{}]: provider recovered after {} trial calls",
                        self.name, state.success_count
                    );
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.lock();
        state.failure_count += 1;

        match state.state {
            CircuitState::Closed if state.failure_count >= self.failure_threshold => {
                error!(
                    "CircuitBreaker [{}]: opened after {} consecutive faults, pausing for {:?}",
                    self.name, state.failure_count, self.cooldown
                );
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                warn!("CircuitBreaker [{}]: trial call failed, reopening", self.name);
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }
}
