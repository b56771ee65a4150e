//! Error type returned by the resilience pipeline and its individual stages.

use std::time::Duration;

/// Upper bound on the number of failures recorded inside `RetryExhausted`.
/// Keeps the error itself from growing without bound when a caller configures
/// an unreasonably high `max_attempts`.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Error produced by a resilience pipeline wrapping an operation of error
/// type `E`. Each variant corresponds to exactly one pipeline stage; `Inner`
/// is the operation's own error, unwrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError<E> {
    /// The operation did not complete before its deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The bulkhead had no free permit.
    Bulkhead { in_flight: usize, max: usize },
    /// The circuit breaker is open and is not accepting calls.
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// The token bucket had no permits and the per-operation deadline passed
    /// before one became available.
    RateLimited { retry_after: Duration },
    /// Every retry attempt failed. `failures` holds up to `MAX_RETRY_FAILURES`
    /// of the underlying errors, oldest first.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The operation's own error, unwrapped by every other pipeline stage.
    Inner(E),
}

impl<E> ResilienceError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. })
    }

    pub fn is_bulkhead(&self) -> bool {
        matches!(self, ResilienceError::Bulkhead { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ResilienceError::RateLimited { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, ResilienceError::RetryExhausted { .. })
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, ResilienceError::Inner(_))
    }

    /// `(elapsed, timeout)` if this is a `Timeout` error.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            ResilienceError::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Unwraps into the inner operation error, if that's what this is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Inner(e) => Some(e),
            _ => None,
        }
    }

    fn push_failure(failures: &mut Vec<E>, failure: E) {
        if failures.len() >= MAX_RETRY_FAILURES {
            failures.remove(0);
        }
        failures.push(failure);
    }

    /// Builds a `RetryExhausted` error, capping the retained failure history
    /// at [`MAX_RETRY_FAILURES`] (oldest dropped first).
    pub fn retry_exhausted(attempts: usize, mut failures: Vec<E>) -> Self {
        while failures.len() > MAX_RETRY_FAILURES {
            failures.remove(0);
        }
        ResilienceError::RetryExhausted { attempts, failures }
    }

    /// Appends a failure to an in-progress failure history, respecting the cap.
    pub fn record_failure(failures: &mut Vec<E>, failure: E) {
        Self::push_failure(failures, failure)
    }
}

impl<E: std::fmt::Display> std::fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResilienceError::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {elapsed:?} (limit {timeout:?})")
            }
            ResilienceError::Bulkhead { in_flight, max } => {
                write!(f, "bulkhead full: {in_flight}/{max} in flight")
            }
            ResilienceError::CircuitOpen { failure_count, open_duration } => {
                write!(
                    f,
                    "circuit open after {failure_count} failures ({open_duration:?} ago)"
                )
            }
            ResilienceError::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {retry_after:?}")
            }
            ResilienceError::RetryExhausted { attempts, failures } => {
                write!(f, "retry exhausted after {attempts} attempts, last error: ")?;
                match failures.last() {
                    Some(e) => write!(f, "{e}"),
                    None => write!(f, "<none recorded>"),
                }
            }
            ResilienceError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for ResilienceError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[test]
    fn predicates_match_variants() {
        let e: ResilienceError<TestError> =
            ResilienceError::Timeout { elapsed: Duration::from_secs(1), timeout: Duration::from_millis(500) };
        assert!(e.is_timeout());
        assert!(!e.is_bulkhead());
    }

    #[test]
    fn retry_exhausted_caps_failure_history() {
        let failures: Vec<TestError> = (0..20).map(|_| TestError("boom")).collect();
        let err = ResilienceError::retry_exhausted(20, failures);
        match err {
            ResilienceError::RetryExhausted { attempts, failures } => {
                assert_eq!(attempts, 20);
                assert_eq!(failures.len(), MAX_RETRY_FAILURES);
            }
            _ => panic!("expected RetryExhausted"),
        }
    }

    #[test]
    fn inner_roundtrips() {
        let e = ResilienceError::Inner(TestError("x"));
        assert!(e.is_inner());
        assert_eq!(e.into_inner(), Some(TestError("x")));
    }

    #[test]
    fn display_formats_each_variant() {
        let timeout: ResilienceError<TestError> =
            ResilienceError::Timeout { elapsed: Duration::from_millis(10), timeout: Duration::from_millis(5) };
        assert!(timeout.to_string().contains("timed out"));

        let bulkhead: ResilienceError<TestError> = ResilienceError::Bulkhead { in_flight: 4, max: 4 };
        assert!(bulkhead.to_string().contains("bulkhead"));

        let open: ResilienceError<TestError> =
            ResilienceError::CircuitOpen { failure_count: 5, open_duration: Duration::from_secs(1) };
        assert!(open.to_string().contains("circuit open"));
    }
}
