//! Generation-counting circuit breaker.
//!
//! Wraps any fallible async operation and gates it through three states:
//!
//! ```text
//! Closed   --(consecutive failures >= threshold)-->  Open
//! Open     --(open timeout elapsed, on next use)-->  HalfOpen
//! HalfOpen --(quota of consecutive successes)----->  Closed
//! HalfOpen --(any failure)------------------------>  Open
//! ```
//!
//! Every transition, and every rollover of the Closed window, starts a new
//! *generation* and clears the counts. A call's outcome is only recorded if
//! the generation that admitted it is still current; a slow call that
//! finishes after the breaker moved on is ignored.
//!
//! The bookkeeping sits behind a single mutex that is never held while the
//! wrapped operation runs.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    /// Calls pass through.
    Closed,
    /// A limited number of probe calls pass through.
    HalfOpen,
    /// Calls are rejected without being attempted.
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        })
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the operation was not attempted.
    #[error("circuit breaker is open")]
    Open,

    /// The breaker is half-open and its probe quota is used up; the operation
    /// was not attempted.
    #[error("circuit breaker is half-open and max requests reached")]
    QuotaExhausted,

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns `true` if the breaker refused the call rather than the
    /// operation failing.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open | Self::QuotaExhausted)
    }
}

/// Circuit breaker tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Probe calls admitted while half-open, and the number of consecutive
    /// successes needed to close again. Zero is treated as one.
    pub max_half_open_requests: u32,

    /// How often the Closed counts roll over. Zero disables the rollover.
    pub closed_window_interval: Duration,

    /// How long the breaker stays open before admitting probes.
    pub open_timeout: Duration,

    /// Consecutive failures, while closed, that open the breaker.
    pub consecutive_failure_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_half_open_requests: 5,
            closed_window_interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            consecutive_failure_threshold: 5,
        }
    }
}

/// Snapshot of the breaker for logs and metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Current state.
    pub state: State,
    /// Calls admitted in the current generation.
    pub requests: u32,
    /// Successes recorded in the current generation.
    pub total_successes: u32,
    /// Failures recorded in the current generation.
    pub total_failures: u32,
    /// Current run of successes.
    pub consecutive_successes: u32,
    /// Current run of failures.
    pub consecutive_failures: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counts {
    requests: u32,
    total_successes: u32,
    total_failures: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Circuit breaker guarding a single dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(mut config: BreakerConfig) -> Self {
        config.max_half_open_requests = config.max_half_open_requests.max(1);

        let mut inner = Inner {
            state: State::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };

        inner.new_generation(&config, Instant::now());

        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    /// Runs `op` if the breaker admits it and records the outcome.
    ///
    /// If the operation panics, or its future is dropped before completing,
    /// the call is recorded as a failure; a panic then continues to unwind.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] or [`BreakerError::QuotaExhausted`] when
    /// the call is refused, and [`BreakerError::Inner`] when `op` fails.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_request()?;

        let mut guard = Outcome {
            breaker: self,
            generation,
            success: false,
        };

        let result = op().await;
        guard.success = result.is_ok();
        drop(guard);

        result.map_err(BreakerError::Inner)
    }

    /// Current state, applying any transition that is due.
    #[must_use]
    pub fn state(&self) -> State {
        let mut inner = self.lock();
        inner.current_state(&self.config, Instant::now()).0
    }

    /// Current state and counts.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut inner = self.lock();
        let (state, _) = inner.current_state(&self.config, Instant::now());
        let counts = inner.counts;

        Stats {
            state,
            requests: counts.requests,
            total_successes: counts.total_successes,
            total_failures: counts.total_failures,
            consecutive_successes: counts.consecutive_successes,
            consecutive_failures: counts.consecutive_failures,
        }
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.lock();
        let (state, generation) = inner.current_state(&self.config, Instant::now());

        match state {
            State::Open => return Err(BreakerError::Open),
            State::HalfOpen if inner.counts.requests >= self.config.max_half_open_requests => {
                return Err(BreakerError::QuotaExhausted);
            }
            _ => {}
        }

        inner.counts.requests = inner.counts.requests.saturating_add(1);
        Ok(generation)
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        let (state, generation) = inner.current_state(&self.config, now);

        if generation != before {
            tracing::debug!(
                admitted = before,
                current = generation,
                "discarding outcome from stale circuit breaker generation"
            );
            return;
        }

        if success {
            inner.on_success(&self.config, state, now);
        } else {
            inner.on_failure(&self.config, state, now);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Counts are plain integers, valid even after a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Applies due time-based transitions and returns the resulting state and
    /// generation.
    fn current_state(&mut self, config: &BreakerConfig, now: Instant) -> (State, u64) {
        match self.state {
            State::Closed => {
                if self.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(config, now);
                }
            }
            State::Open => {
                if self.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(config, State::HalfOpen, now);
                }
            }
            State::HalfOpen => {}
        }

        (self.state, self.generation)
    }

    fn on_success(&mut self, config: &BreakerConfig, state: State, now: Instant) {
        self.counts.on_success();

        if state == State::HalfOpen
            && self.counts.consecutive_successes >= config.max_half_open_requests
        {
            self.set_state(config, State::Closed, now);
        }
    }

    fn on_failure(&mut self, config: &BreakerConfig, state: State, now: Instant) {
        self.counts.on_failure();

        match state {
            State::Closed
                if self.counts.consecutive_failures >= config.consecutive_failure_threshold =>
            {
                self.set_state(config, State::Open, now);
            }
            State::HalfOpen => self.set_state(config, State::Open, now),
            _ => {}
        }
    }

    fn set_state(&mut self, config: &BreakerConfig, state: State, now: Instant) {
        if self.state == state {
            return;
        }

        tracing::info!(from = %self.state, to = %state, "circuit breaker state changed");

        self.state = state;
        self.new_generation(config, now);
    }

    fn new_generation(&mut self, config: &BreakerConfig, now: Instant) {
        self.generation = self.generation.wrapping_add(1);
        self.counts = Counts::default();

        self.expiry = match self.state {
            State::Closed if config.closed_window_interval.is_zero() => None,
            State::Closed => Some(now + config.closed_window_interval),
            State::Open => Some(now + config.open_timeout),
            State::HalfOpen => None,
        };
    }
}

/// Records the outcome of an admitted call when dropped.
///
/// Dropping before `success` is set covers both panics and cancellation.
struct Outcome<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    success: bool,
}

impl Drop for Outcome<'_> {
    fn drop(&mut self) {
        self.breaker.after_request(self.generation, self.success);
    }
}
