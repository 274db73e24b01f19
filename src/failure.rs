//! Failure classification and the retry error type.
//!
//! HTTP outcomes split along two axes: whether a schema-valid error body
//! arrived, and whether the status reads as a timeout. Retried failures
//! surface as [`ExecuteError::Retry`]; everything else flows through the
//! store's `fail_execution` as a normal return.

use serde_json::Value;

use crate::endpoint::ErrorBody;
use crate::store::StoreError;

/// Error surface of one execute call. `Retry` is the only variant the queue
/// worker reschedules for.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("execution failed and should be retried")]
    Retry { output: Value },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecuteError {
    pub fn retry_with(output: Value) -> Self {
        ExecuteError::Retry { output }
    }
}

impl From<serde_json::Error> for ExecuteError {
    fn from(err: serde_json::Error) -> Self {
        ExecuteError::Store(StoreError::from(err))
    }
}

/// How a non-2xx endpoint response is handled.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpFailure {
    /// 4xx with a schema-valid error body: fail the run, no retry.
    Client { error: ErrorBody },
    /// 5xx with a schema-valid error body: queue retry.
    ServerWithBody { error: ErrorBody },
    /// 4xx (but not 408) without a usable body: fail the run, no retry.
    ClientOpaque,
    /// A recognised timeout: the timeout-resume path decides.
    Timeout,
    /// Anything else: queue retry.
    Transport,
}

/// Statuses treated as a timeout variant of the endpoint's own timer.
pub fn is_timeout_status(status: u16) -> bool {
    status == 408 || status == 504
}

/// Classify a non-2xx response per the error body (if one parsed).
pub fn classify_http_failure(status: u16, error: Option<ErrorBody>) -> HttpFailure {
    if let Some(error) = error {
        if (400..500).contains(&status) {
            return HttpFailure::Client { error };
        }
        return HttpFailure::ServerWithBody { error };
    }
    if (400..500).contains(&status) && status != 408 {
        return HttpFailure::ClientOpaque;
    }
    if is_timeout_status(status) {
        return HttpFailure::Timeout;
    }
    HttpFailure::Transport
}

/// Backoff schedule for re-delivered queue messages:
/// `base * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryBackoff {
    pub fn delay_ms(&self, attempt: i32) -> i64 {
        if attempt <= 0 {
            return self.base_delay_ms.min(self.max_delay_ms);
        }
        let exp = (attempt - 1).min(30) as u32;
        let delay = self.base_delay_ms.saturating_mul(1i64 << exp);
        delay.min(self.max_delay_ms)
    }
}
