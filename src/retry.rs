// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Exponential backoff for fallible asynchronous operations.
//!
//! Remote queries, clones, and individual installation items all share the
//! same retry discipline: an operation is attempted up to a fixed number of
//! times, and the pause after failed attempt `n` is `base_delay * 2^(n-1)`.
//! No pause follows the final attempt.

use std::{future::Future, time::Duration};
use tracing::{debug, warn};

/// Retry discipline for a fallible operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Construct new retry policy.
    ///
    /// A policy always makes at least one attempt, so an attempt count of
    /// zero is treated as one.
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Policy that never retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Total number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Base delay used for the first retry.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Retry an operation until it succeeds or attempts run out.
    ///
    /// The operation receives the current attempt number, starting at 1.
    ///
    /// # Errors
    ///
    /// - Return [`RetryError::OperationFailed`] with the last error once every
    ///   attempt has failed.
    pub async fn retry<T, E, F, Fut>(
        &self,
        context: impl Into<String>,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_if(context, operation, |_| true).await
    }

    /// Retry an operation, giving up early on errors that cannot recover.
    ///
    /// Errors rejected by `is_retryable` are returned at once as
    /// [`RetryError::Aborted`].
    ///
    /// # Errors
    ///
    /// - Return [`RetryError::OperationFailed`] once every attempt has failed.
    /// - Return [`RetryError::Aborted`] for non-retryable errors.
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        context: impl Into<String>,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let context = context.into();
        let mut attempt = 1;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_retryable(&error) {
                debug!("{context} failed with non-retryable error: {error}");
                return Err(RetryError::Aborted {
                    context,
                    source: error,
                });
            }

            if attempt >= self.attempts {
                warn!("{context} failed after {attempt} attempt(s): {error}");
                return Err(RetryError::OperationFailed {
                    context,
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            debug!("{context} attempt {attempt} failed ({error}), retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

/// Retry failure.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed.
    #[error("{context} failed after {attempts} attempt(s): {source}")]
    OperationFailed {
        context: String,
        attempts: u32,
        source: E,
    },

    /// Operation hit an error that retrying cannot fix.
    #[error("{context} failed: {source}")]
    Aborted { context: String, source: E },
}

impl<E> RetryError<E> {
    /// Error produced by the last attempt.
    pub fn last_error(&self) -> &E {
        match self {
            Self::OperationFailed { source, .. } | Self::Aborted { source, .. } => source,
        }
    }
}
