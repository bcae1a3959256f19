//! Decides, after a failed attempt, whether the executor may try again and
//! on what schedule. Distinct from [`crate::speculative`],
//! which decides whether to fire a *second, parallel* attempt before the
//! first one has even failed.

use crate::error::{DriverError, ServerError};
use std::fmt::Debug;
use std::time::Duration;

pub use exponential_backoff::Backoff;

/// What the executor should do after an attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and surface the error to the caller.
    Rethrow,
    /// Retry against the same host that just failed.
    RetrySame,
    /// Retry against the next host in the load-balancing plan.
    RetryNext,
    /// Retry without counting against the attempt budget. Used for the
    /// `UNPREPARED` re-prepare-then-retry path, which is not a policy
    /// decision but a protocol requirement: the statement
    /// itself never reached the server the first time.
    Ignore,
}

/// Determines whether a failed attempt should be retried, against which
/// host, and how long to wait first. Implementations must be cheap and
/// side-effect-free except through `&mut self`'s own state, since the
/// executor owns one instance per logical request (not per connection).
pub trait Retry: Debug + Clone + Send {
    /// Called once per request before its first attempt, and again
    /// whenever an attempt succeeds, so a dynamic backoff schedule
    /// doesn't carry state across unrelated requests.
    fn reset(&mut self);

    /// `attempts` counts completed attempts so far (1 after the first
    /// failure). `idempotent` mirrors the statement's own flag: most
    /// policies refuse to retry a write-affecting error unless it's set.
    fn decide(&mut self, error: &DriverError, idempotent: bool, attempts: u32) -> RetryDecision;

    /// Delay to wait before the retried attempt fires, or `None` to retry
    /// immediately. Only consulted when `decide` didn't return `Rethrow`.
    fn backoff(&mut self, attempts: u32) -> Option<Duration>;
}

/// Never retries; every failure is surfaced immediately. Appropriate for
/// callers that implement their own retry loop above the driver.
#[derive(Debug, Clone, Default)]
pub struct NoRetry;

impl Retry for NoRetry {
    fn reset(&mut self) {}

    fn decide(&mut self, _error: &DriverError, _idempotent: bool, _attempts: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn backoff(&mut self, _attempts: u32) -> Option<Duration> {
        None
    }
}

/// The default policy: retries connection-level failures
/// and timeouts against the next host without an idempotency requirement
/// (nothing was necessarily sent), but only retries a server-reported
/// write/read timeout or failure when the statement is marked idempotent,
/// since those indicate the write may already have landed on some
/// replicas. Backoff follows an exponential schedule via the
/// `exponential-backoff` crate.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    max_retries: u32,
    backoff: Backoff,
}

impl DefaultRetryPolicy {
    pub fn new(max_retries: u32) -> DefaultRetryPolicy {
        DefaultRetryPolicy {
            max_retries,
            backoff: Backoff::new(max_retries, Duration::from_millis(50), Some(Duration::from_secs(5))),
        }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Retry for DefaultRetryPolicy {
    fn reset(&mut self) {}

    fn decide(&mut self, error: &DriverError, idempotent: bool, attempts: u32) -> RetryDecision {
        if attempts > self.max_retries {
            return RetryDecision::Rethrow;
        }
        match error {
            DriverError::Connection { .. } | DriverError::ConnectionClosed { .. } => RetryDecision::RetryNext,
            DriverError::Timeout => {
                if idempotent {
                    RetryDecision::RetryNext
                } else {
                    RetryDecision::Rethrow
                }
            }
            DriverError::Server(server_err) => self.decide_server_error(server_err, idempotent),
            _ => RetryDecision::Rethrow,
        }
    }

    fn backoff(&mut self, attempts: u32) -> Option<Duration> {
        self.backoff.next(attempts)
    }
}

impl DefaultRetryPolicy {
    fn decide_server_error(&self, error: &ServerError, idempotent: bool) -> RetryDecision {
        match error {
            // Another coordinator is very likely to succeed immediately;
            // no backoff needed, retry without consuming the idempotency
            // exception since no mutation was even attempted.
            ServerError::Unavailable { .. } => RetryDecision::RetryNext,
            ServerError::Overloaded { .. } | ServerError::IsBootstrapping { .. } => RetryDecision::RetryNext,
            ServerError::ReadTimeout { data_present, .. } => {
                // Enough replicas answered but without data: safe to retry
                // regardless of idempotency, since reads have no side
                // effect to double-apply.
                if *data_present {
                    RetryDecision::Rethrow
                } else {
                    RetryDecision::RetrySame
                }
            }
            ServerError::ReadFailure { .. } => RetryDecision::Rethrow,
            ServerError::WriteTimeout { .. } | ServerError::WriteFailure { .. } | ServerError::CasWriteUnknown { .. } => {
                if idempotent {
                    RetryDecision::RetrySame
                } else {
                    RetryDecision::Rethrow
                }
            }
            _ => RetryDecision::Rethrow,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cql_protocol::Consistency;

    #[test]
    fn non_idempotent_write_timeout_is_not_retried() {
        let mut policy = DefaultRetryPolicy::new(3);
        let err = DriverError::Server(ServerError::WriteTimeout {
            message: "".into(),
            consistency: Consistency::Quorum,
            received: 1,
            block_for: 2,
            write_type: "SIMPLE".into(),
        });
        assert_eq!(policy.decide(&err, false, 1), RetryDecision::Rethrow);
    }

    #[test]
    fn idempotent_write_timeout_retries_same_host() {
        let mut policy = DefaultRetryPolicy::new(3);
        let err = DriverError::Server(ServerError::WriteTimeout {
            message: "".into(),
            consistency: Consistency::Quorum,
            received: 1,
            block_for: 2,
            write_type: "SIMPLE".into(),
        });
        assert_eq!(policy.decide(&err, true, 1), RetryDecision::RetrySame);
    }

    #[test]
    fn read_timeout_without_data_always_retries() {
        let mut policy = DefaultRetryPolicy::new(3);
        let err = DriverError::Server(ServerError::ReadTimeout {
            message: "".into(),
            consistency: Consistency::Quorum,
            received: 1,
            block_for: 2,
            data_present: false,
        });
        assert_eq!(policy.decide(&err, false, 1), RetryDecision::RetrySame);
    }

    #[test]
    fn exhausted_retry_budget_rethrows() {
        let mut policy = DefaultRetryPolicy::new(1);
        let err = DriverError::Timeout;
        assert_eq!(policy.decide(&err, true, 2), RetryDecision::Rethrow);
    }

    #[test]
    fn unavailable_retries_without_idempotency_requirement() {
        let mut policy = DefaultRetryPolicy::new(3);
        let err = DriverError::Server(ServerError::Unavailable {
            message: "".into(),
            consistency: Consistency::Quorum,
            required: 2,
            alive: 1,
        });
        assert_eq!(policy.decide(&err, false, 1), RetryDecision::RetryNext);
    }
}
