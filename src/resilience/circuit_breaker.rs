//! Per-service circuit breaker.
//!
//! Three states: Closed (calls pass, failures counted), Open (calls rejected
//! until the recovery timeout elapses), HalfOpen (exactly one trial call
//! admitted). Transitions are lazy; no background timers.

use std::time::{Duration, Instant};
use tracing::info;

use crate::config::BreakerPolicy;
use crate::{Failure, Result};

/// Current breaker state, exposed for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

/// Proof that a call was admitted. Must be handed back through exactly one of
/// [`CircuitBreaker::record_success`], [`CircuitBreaker::record_failure`], or
/// [`CircuitBreaker::cancel`] so a HalfOpen trial slot is never leaked.
#[derive(Debug)]
#[must_use = "admission must be resolved via record_success/record_failure/cancel"]
pub struct Admission {
    trial: bool,
}

impl Admission {
    /// Whether this admission is the single HalfOpen trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug)]
enum Circuit {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct State {
    circuit: Circuit,
    consecutive_failures: u32,
}

pub struct CircuitBreaker {
    service: String,
    policy: BreakerPolicy,
    state: std::sync::Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            service: service.into(),
            policy,
            state: std::sync::Mutex::new(State {
                circuit: Circuit::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| {
            Failure::transient(format!("circuit breaker for {} poisoned", self.service))
        })
    }

    /// Admission gate. Open circuits reject immediately; an Open circuit whose
    /// recovery timeout has elapsed moves to HalfOpen and admits this caller
    /// as the single trial. Concurrent HalfOpen callers are rejected as Open.
    pub fn admit(&self) -> Result<Admission> {
        let mut st = self.lock()?;
        match st.circuit {
            Circuit::Closed => Ok(Admission { trial: false }),
            Circuit::Open { opened_at } => {
                if opened_at.elapsed() >= self.policy.recovery_timeout() {
                    info!(service = %self.service, from = %CircuitState::Open, to = %CircuitState::HalfOpen,
                          "circuit state transition");
                    st.circuit = Circuit::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(Admission { trial: true })
                } else {
                    Err(Failure::circuit_open(format!(
                        "circuit open for service {}",
                        self.service
                    )))
                }
            }
            Circuit::HalfOpen {
                ref mut trial_in_flight,
            } => {
                if *trial_in_flight {
                    Err(Failure::circuit_open(format!(
                        "circuit half-open for service {}, trial in flight",
                        self.service
                    )))
                } else {
                    *trial_in_flight = true;
                    Ok(Admission { trial: true })
                }
            }
        }
    }

    /// A backend call admitted by [`admit`](Self::admit) succeeded.
    pub fn record_success(&self, admission: Admission) {
        if let Ok(mut st) = self.lock() {
            if admission.trial {
                info!(service = %self.service, from = %CircuitState::HalfOpen, to = %CircuitState::Closed,
                      "circuit state transition");
            }
            st.circuit = Circuit::Closed;
            st.consecutive_failures = 0;
        }
    }

    /// A backend call admitted by [`admit`](Self::admit) failed.
    ///
    /// Failures that do not count toward the breaker (payload rejections,
    /// credential problems) release the admission without affecting state.
    pub fn record_failure(&self, admission: Admission, failure: &Failure) {
        if !failure.counts_toward_breaker() {
            self.cancel(admission);
            return;
        }
        if let Ok(mut st) = self.lock() {
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            match st.circuit {
                Circuit::HalfOpen { .. } => {
                    // Trial failed: re-open and restart the same timeout.
                    info!(service = %self.service, from = %CircuitState::HalfOpen, to = %CircuitState::Open,
                          "circuit state transition");
                    st.circuit = Circuit::Open {
                        opened_at: Instant::now(),
                    };
                }
                Circuit::Closed => {
                    if st.consecutive_failures >= self.policy.failure_threshold {
                        info!(service = %self.service, from = %CircuitState::Closed, to = %CircuitState::Open,
                              failures = st.consecutive_failures, "circuit state transition");
                        st.circuit = Circuit::Open {
                            opened_at: Instant::now(),
                        };
                    }
                }
                Circuit::Open { .. } => {}
            }
        }
    }

    /// Release an admission when the call never reached the backend (e.g. the
    /// limiter or credential lookup bailed first). Neither success nor failure
    /// is recorded; a HalfOpen trial slot is handed back.
    pub fn cancel(&self, admission: Admission) {
        if !admission.trial {
            return;
        }
        if let Ok(mut st) = self.lock() {
            if let Circuit::HalfOpen {
                ref mut trial_in_flight,
            } = st.circuit
            {
                *trial_in_flight = false;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.lock() {
            Ok(st) => match st.circuit {
                Circuit::Closed => CircuitState::Closed,
                Circuit::Open { .. } => CircuitState::Open,
                Circuit::HalfOpen { .. } => CircuitState::HalfOpen,
            },
            Err(_) => CircuitState::Open,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        match self.lock() {
            Ok(st) => {
                let (state, open_remaining_ms) = match st.circuit {
                    Circuit::Closed => (CircuitState::Closed, None),
                    Circuit::HalfOpen { .. } => (CircuitState::HalfOpen, None),
                    Circuit::Open { opened_at } => {
                        let remaining = self
                            .policy
                            .recovery_timeout()
                            .saturating_sub(opened_at.elapsed());
                        let ms = if remaining > Duration::ZERO {
                            Some(remaining.as_millis() as u64)
                        } else {
                            None
                        };
                        (CircuitState::Open, ms)
                    }
                };
                BreakerSnapshot {
                    state,
                    consecutive_failures: st.consecutive_failures,
                    open_remaining_ms,
                }
            }
            Err(_) => BreakerSnapshot {
                state: CircuitState::Open,
                consecutive_failures: 0,
                open_remaining_ms: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn policy(threshold: u32, timeout_ms: u64) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: threshold,
            recovery_timeout_ms: timeout_ms,
        }
    }

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new("jira", BreakerPolicy::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        let adm = cb.admit().unwrap();
        cb.record_success(adm);
    }

    #[test]
    fn opens_at_threshold() {
        let cb = CircuitBreaker::new("jira", policy(3, 60_000));
        for _ in 0..2 {
            let adm = cb.admit().unwrap();
            cb.record_failure(adm, &Failure::transient("boom"));
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        let adm = cb.admit().unwrap();
        cb.record_failure(adm, &Failure::transient("boom"));
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.admit().unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::CircuitOpen);
        assert!(cb.snapshot().open_remaining_ms.is_some());
    }

    #[test]
    fn business_failures_do_not_count() {
        let cb = CircuitBreaker::new("jira", policy(2, 60_000));
        for _ in 0..5 {
            let adm = cb.admit().unwrap();
            cb.record_failure(adm, &Failure::validation("bad field"));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn success_resets_counter() {
        let cb = CircuitBreaker::new("jira", policy(3, 60_000));
        let adm = cb.admit().unwrap();
        cb.record_failure(adm, &Failure::transient("boom"));
        let adm = cb.admit().unwrap();
        cb.record_failure(adm, &Failure::transient("boom"));
        assert_eq!(cb.snapshot().consecutive_failures, 2);

        let adm = cb.admit().unwrap();
        cb.record_success(adm);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn half_open_admits_single_trial() {
        let cb = CircuitBreaker::new("jira", policy(1, 20));
        let adm = cb.admit().unwrap();
        cb.record_failure(adm, &Failure::transient("boom"));
        assert_eq!(cb.state(), CircuitState::Open);

        thread::sleep(Duration::from_millis(30));

        // First admission after the timeout is the trial.
        let trial = cb.admit().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Concurrent admissions are rejected while the trial is in flight.
        assert!(cb.admit().is_err());

        cb.record_success(trial);
        assert_eq!(cb.state(), CircuitState::Closed);
        let adm = cb.admit().unwrap();
        cb.record_success(adm);
    }

    #[test]
    fn trial_failure_reopens_with_restarted_timeout() {
        let cb = CircuitBreaker::new("jira", policy(1, 20));
        let adm = cb.admit().unwrap();
        cb.record_failure(adm, &Failure::transient("boom"));

        thread::sleep(Duration::from_millis(30));
        let trial = cb.admit().unwrap();
        cb.record_failure(trial, &Failure::transient("still down"));
        assert_eq!(cb.state(), CircuitState::Open);

        // Timeout restarted: still rejected immediately after the trial.
        assert!(cb.admit().is_err());
        thread::sleep(Duration::from_millis(30));
        let trial = cb.admit().unwrap();
        cb.record_success(trial);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn cancel_releases_trial_slot() {
        let cb = CircuitBreaker::new("jira", policy(1, 10));
        let adm = cb.admit().unwrap();
        cb.record_failure(adm, &Failure::transient("boom"));

        thread::sleep(Duration::from_millis(20));
        let trial = cb.admit().unwrap();
        assert!(cb.admit().is_err());

        // Call never reached the backend; the next caller gets the trial.
        cb.cancel(trial);
        let trial = cb.admit().unwrap();
        cb.record_success(trial);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn concurrent_failures_are_counted_once_each() {
        use std::sync::Arc;

        let cb = Arc::new(CircuitBreaker::new("jira", policy(1000, 60_000)));
        let mut handles = vec![];
        for _ in 0..8 {
            let cb = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                for _ in 0..10 {
                    if let Ok(adm) = cb.admit() {
                        cb.record_failure(adm, &Failure::transient("boom"));
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot().consecutive_failures, 80);
    }
}
