//! Resilient Executor
//!
//! Wraps every remote call with bounded exponential backoff and a minimum
//! spacing between calls. Every suspension point checks the cancellation
//! token first and wakes up early if it fires mid-sleep.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aws::ServiceError;
use crate::config::RetrySettings;
use crate::error::FinderError;

/// How a failed attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Retry only throttling and transient service faults
pub fn retry_transient(err: &ServiceError) -> Classification {
    if err.is_transient() {
        Classification::Retryable
    } else {
        Classification::Fatal
    }
}

/// Why `execute` gave up
#[derive(Debug, PartialEq, Eq)]
pub enum ExecutionError<E> {
    /// Classified fatal on its first occurrence
    Fatal(E),
    /// Every allowed attempt failed with a retryable error
    RetriesExhausted { attempts: u32, last: E },
    Cancelled,
}

impl ExecutionError<ServiceError> {
    /// Map into the crate taxonomy; `fatal` decides what a fatal error means
    pub fn into_finder_error(
        self,
        operation: &str,
        fatal: impl FnOnce(ServiceError) -> FinderError,
    ) -> FinderError {
        match self {
            Self::Fatal(err) => fatal(err),
            Self::RetriesExhausted { attempts, last } => FinderError::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                last,
            },
            Self::Cancelled => FinderError::Cancelled,
        }
    }
}

/// Per-invocation bookkeeping, dropped when `execute` returns
#[derive(Debug)]
struct RetryState {
    attempt_number: u32,
    last_error: Option<String>,
    next_delay: Duration,
}

/// Retry + rate-limit wrapper shared by every component of a run
#[derive(Debug)]
pub struct ResilientExecutor {
    settings: RetrySettings,
    /// When the previous call (through this instance) returned
    last_call: Mutex<Option<Instant>>,
}

impl ResilientExecutor {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            last_call: Mutex::new(None),
        }
    }

    /// Run `op` until it succeeds, fails fatally, runs out of attempts, or
    /// `cancel` fires.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        classify: C,
        mut op: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Classification,
        E: Display,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut state = RetryState {
            attempt_number: 0,
            last_error: None,
            next_delay: Duration::ZERO,
        };

        loop {
            state.attempt_number += 1;

            if state.attempt_number > 1 {
                debug!(
                    operation,
                    attempt = state.attempt_number,
                    delay_ms = state.next_delay.as_millis() as u64,
                    last_error = state.last_error.as_deref().unwrap_or_default(),
                    "Backing off before retry"
                );
                if !self.suspend(state.next_delay, cancel).await {
                    return Err(ExecutionError::Cancelled);
                }
            }

            if !self.wait_for_spacing(cancel).await || cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let result = op().await;
            self.mark_returned();

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match classify(&err) {
                Classification::Fatal => {
                    debug!(operation, error = %err, "Fatal error, not retrying");
                    return Err(ExecutionError::Fatal(err));
                }
                Classification::Retryable if state.attempt_number >= max_attempts => {
                    warn!(
                        operation,
                        attempts = state.attempt_number,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(ExecutionError::RetriesExhausted {
                        attempts: state.attempt_number,
                        last: err,
                    });
                }
                Classification::Retryable => {
                    warn!(
                        operation,
                        attempt = state.attempt_number,
                        error = %err,
                        "Retryable error"
                    );
                    state.next_delay = self.settings.backoff_delay(state.attempt_number);
                    state.last_error = Some(err.to_string());
                }
            }
        }
    }

    /// Cancellable pause outside of any retry loop
    pub async fn pause(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), FinderError> {
        if self.suspend(duration, cancel).await {
            Ok(())
        } else {
            Err(FinderError::Cancelled)
        }
    }

    /// Sleep for the rest of the spacing window since the last call returned
    async fn wait_for_spacing(&self, cancel: &CancellationToken) -> bool {
        let last = *self.last_call.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(last) = last else {
            return true;
        };

        let elapsed = last.elapsed();
        if elapsed >= self.settings.min_call_spacing {
            return true;
        }
        self.suspend(self.settings.min_call_spacing - elapsed, cancel)
            .await
    }

    fn mark_returned(&self) {
        *self.last_call.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Returns false if cancelled before or during the sleep
    async fn suspend(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}
