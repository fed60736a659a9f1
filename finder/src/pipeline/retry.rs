//! Shared retry/skip policy for remote calls
//!
//! - rate limited (429): skip at once, never retried
//! - transient (timeouts, connection resets, 5xx): retried after
//!   `backoff_start * 2^(attempt - 1)`
//! - anything else: skipped without retry
//!
//! Every attempt runs under `attempt_timeout`.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use super::warnings::{record, Warnings};
use crate::rpc::RpcError;

/// Initial try plus one retry
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

pub const DEFAULT_BACKOFF_START: Duration = Duration::from_millis(500);

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_start: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_start: DEFAULT_BACKOFF_START,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// How a failed attempt is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Transient,
    Other,
}

/// Why a call was given up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RateLimit,
    Error,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::RateLimit => write!(f, "rate_limit"),
            SkipReason::Error => write!(f, "error"),
        }
    }
}

/// Result of running one operation under the policy
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: Option<T>,
    /// Always in `1..=max_attempts`
    pub attempts: u32,
    pub skip: Option<SkipReason>,
}

impl<T> RetryOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.value.is_some()
    }
}

/// A single attempt exceeded `attempt_timeout`
#[derive(Debug, thiserror::Error)]
#[error("attempt timed out after {:.1}s", .0.as_secs_f64())]
pub struct AttemptTimeout(pub Duration);

/// Classify an error by walking its source chain
pub fn classify_failure(error: &anyhow::Error) -> FailureKind {
    for cause in error.chain() {
        if let Some(rpc) = cause.downcast_ref::<RpcError>() {
            if rpc.is_rate_limited() {
                return FailureKind::RateLimited;
            }
            if rpc.is_transient() {
                return FailureKind::Transient;
            }
        }
        if cause.is::<AttemptTimeout>() || cause.is::<tokio::time::error::Elapsed>() {
            return FailureKind::Transient;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::HostUnreachable
                    | std::io::ErrorKind::TimedOut
            ) {
                return FailureKind::Transient;
            }
        }
    }

    let message = format!("{:#}", error);
    if message.contains("429") && message.to_lowercase().contains("rate") {
        FailureKind::RateLimited
    } else {
        FailureKind::Other
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_start * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `operation` with the retry/skip policy, recording warnings as `"<service> <stage> ..."`
    ///
    /// Each line lands in `warnings` as soon as it is produced.
    pub async fn run<T, F, Fut>(
        &self,
        service: &str,
        stage: &str,
        warnings: &Mutex<Warnings>,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let result = match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(AttemptTimeout(self.attempt_timeout).into()),
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        record(
                            warnings,
                            format!("{} {} succeeded after retry #{}", service, stage, attempt - 1),
                        );
                    }
                    return RetryOutcome {
                        value: Some(value),
                        attempts: attempt,
                        skip: None,
                    };
                }
                Err(error) => error,
            };

            let kind = classify_failure(&error);
            if kind == FailureKind::RateLimited {
                record(
                    warnings,
                    format!(
                        "{} {} skipped due to rate limit (429): {:#}",
                        service, stage, error
                    ),
                );
                return RetryOutcome {
                    value: None,
                    attempts: attempt,
                    skip: Some(SkipReason::RateLimit),
                };
            }

            if kind != FailureKind::Transient || attempt >= max_attempts {
                record(
                    warnings,
                    format!(
                        "{} {} failed after {} attempt(s): {:#}",
                        service, stage, attempt, error
                    ),
                );
                return RetryOutcome {
                    value: None,
                    attempts: attempt,
                    skip: Some(SkipReason::Error),
                };
            }

            let delay = self.backoff_for(attempt);
            record(
                warnings,
                format!(
                    "{} {} transient error on attempt {}: {:#}; retrying in {:.1}s",
                    service,
                    stage,
                    attempt,
                    error,
                    delay.as_secs_f64()
                ),
            );
            tokio::time::sleep(delay).await;
        }

        RetryOutcome {
            value: None,
            attempts: max_attempts,
            skip: Some(SkipReason::Error),
        }
    }
}
