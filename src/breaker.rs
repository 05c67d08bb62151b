
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Why a request was rejected without touching the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Breaker is open and the reset timeout has not elapsed.
    Open,
    /// Breaker is half-open and the single probe slot is taken.
    TooManyRequests,
}

/// Three-state circuit breaker: CLOSED -> OPEN after `failure_threshold`
/// consecutive failures, OPEN -> HALF-OPEN after `reset_timeout`, then
/// HALF-OPEN -> CLOSED on the probe's success or back to OPEN on its failure.
/// Half-open admits exactly one in-flight probe.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT)
    }

    pub fn with_settings(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, observing the reset timeout (OPEN past the timeout
    /// reads as HALF-OPEN).
    pub fn state(&self) -> State {
        let mut inner = self.inner.lock().unwrap();
        Self::refresh(&mut inner, self.reset_timeout);
        inner.state
    }

    /// Admission check before an upstream call. `Ok` in half-open claims the
    /// probe slot; the caller must follow up with `on_success`/`on_failure`.
    pub fn try_acquire(&self) -> Result<(), Rejection> {
        let mut inner = self.inner.lock().unwrap();
        Self::refresh(&mut inner, self.reset_timeout);
        match inner.state {
            State::Closed => Ok(()),
            State::Open => Err(Rejection::Open),
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Rejection::TooManyRequests)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::HalfOpen => {
                inner.state = State::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            State::Closed => inner.consecutive_failures = 0,
            State::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            State::Open => {}
        }
    }

    fn refresh(inner: &mut Inner, reset_timeout: Duration) {
        if inner.state == State::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= reset_timeout {
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = false;
                }
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::with_settings(5, Duration::from_millis(20))
    }

    #[test]
    fn starts_closed_and_admits() {
        let cb = CircuitBreaker::new();
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn trips_after_five_consecutive_failures() {
        let cb = fast_breaker();
        for _ in 0..4 {
            cb.on_failure();
            assert_eq!(cb.state(), State::Closed);
        }
        cb.on_failure();
        assert_eq!(cb.state(), State::Open);
        assert_eq!(cb.try_acquire(), Err(Rejection::Open));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = fast_breaker();
        for _ in 0..4 {
            cb.on_failure();
        }
        cb.on_success();
        for _ in 0..4 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn half_open_after_reset_timeout_admits_one_probe() {
        let cb = fast_breaker();
        for _ in 0..5 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cb.state(), State::HalfOpen);
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.try_acquire(), Err(Rejection::TooManyRequests));
    }

    #[test]
    fn half_open_probe_success_closes() {
        let cb = fast_breaker();
        for _ in 0..5 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.try_acquire().is_ok());
        cb.on_success();
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let cb = fast_breaker();
        for _ in 0..5 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.try_acquire().is_ok());
        cb.on_failure();
        assert_eq!(cb.try_acquire(), Err(Rejection::Open));
        // And it can recover again after another timeout.
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.try_acquire().is_ok());
    }
}
