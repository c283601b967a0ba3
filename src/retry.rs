//! Retry helpers for directory and ledger calls.
//!
//! Directory calls retry without a cap: a rate limit sleeps for the
//! server-provided remaining seconds plus one, any other transient failure is
//! retried right away. API errors with a message are returned as-is.
//!
//! Ledger calls only retry errors where [`LedgerError::is_transient`] holds,
//! with exponential backoff from one second.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{DirectoryError, LedgerError};

const RATE_LIMIT_PADDING: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries until success.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Submission and confirmation calls.
    pub fn ledger() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(8),
        }
    }

    /// Calls that have to succeed for the batch to make progress.
    pub fn forever() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }

    /// No delay between a few attempts.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: Some(3),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

/// Retry a ledger call on transient errors only.
pub async fn retry_ledger_call<T, F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempts = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                attempts += 1;
                if policy.exhausted(attempts) {
                    return Err(err);
                }
                let wait = policy.delay_for(attempts - 1);
                debug!(error = %err, attempt = attempts, wait_ms = wait.as_millis() as u64, "Retrying ledger call");
                sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retry a ledger call on any error until it succeeds.
pub async fn retry_until_ok<T, F, Fut>(policy: &RetryPolicy, what: &str, mut call: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut retries = 0u32;
    loop {
        match call().await {
            Ok(value) => return value,
            Err(err) => {
                let wait = policy.delay_for(retries);
                info!(error = %err, wait_ms = wait.as_millis() as u64, "retrying {} call", what);
                retries = retries.saturating_add(1);
                sleep(wait).await;
            }
        }
    }
}

/// Retry a directory call until it succeeds or fails permanently.
pub async fn retry_directory_call<T, F, Fut>(mut call: F) -> Result<T, DirectoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DirectoryError>>,
{
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(DirectoryError::RateLimited { secs_remaining }) => {
                warn!(waiting = secs_remaining, "Rate limited by directory api");
                sleep(Duration::from_secs(secs_remaining) + RATE_LIMIT_PADDING).await;
            }
            Err(DirectoryError::Transient(msg)) => {
                debug!(error = %msg, "Retrying directory call");
                tokio::task::yield_now().await;
            }
            Err(err) => return Err(err),
        }
    }
}
