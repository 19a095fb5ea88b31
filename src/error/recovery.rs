//! Local recovery for retryable errors
//!
//! The dispatcher is the single place that observes and possibly consumes
//! retryable errors before re-surfacing them: out-of-memory triggers one
//! pool trim plus one retry, timeouts back off up to the configured attempt
//! count, and transient driver errors get one more chance. Everything else
//! passes through untouched.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sink::{ErrorEvent, ErrorLogger};
use super::{Error, Result, RetryStrategy};

/// Retry tuning for the recovery dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Max retries for timeouts (the spec default is 3)
    pub max_timeout_retries: u32,
    /// Base backoff delay, doubled per attempt
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_timeout_retries: 3,
            backoff_base: Duration::from_millis(10),
        }
    }
}

/// Hooks the dispatcher may invoke while recovering
pub struct RecoveryHooks<'a> {
    /// Releases pooled memory; invoked once before retrying an OOM failure
    pub trim: Option<&'a dyn Fn()>,
}

impl<'a> RecoveryHooks<'a> {
    pub fn none() -> Self {
        Self { trim: None }
    }

    pub fn with_trim(trim: &'a dyn Fn()) -> Self {
        Self { trim: Some(trim) }
    }
}

/// Retry dispatcher for retryable runtime errors
pub struct RecoveryDispatcher {
    logger: Arc<ErrorLogger>,
    config: RetryConfig,
}

impl RecoveryDispatcher {
    pub fn new(logger: Arc<ErrorLogger>, config: RetryConfig) -> Self {
        Self { logger, config }
    }

    pub fn logger(&self) -> &Arc<ErrorLogger> {
        &self.logger
    }

    /// Run `op`, consuming retryable failures per the recovery policy.
    ///
    /// Fatal errors and exhausted retries surface unchanged. Every failed
    /// attempt is reported to the structured logger with its attempt count.
    pub fn run<T>(
        &self,
        operation: &str,
        hooks: RecoveryHooks<'_>,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt: u32 = 1;
        let mut trimmed = false;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.logger
                        .report(ErrorEvent::new(&err, operation).with_attempt(attempt));

                    let retry = match err.retry_strategy() {
                        RetryStrategy::NoRetry => false,
                        RetryStrategy::TrimAndRetry => {
                            if trimmed {
                                false
                            } else if let Some(trim) = hooks.trim {
                                debug!("recovery: trimming pool before retrying {}", operation);
                                trim();
                                trimmed = true;
                                true
                            } else {
                                false
                            }
                        }
                        RetryStrategy::Backoff { max_retries } => {
                            let limit = match err {
                                Error::Timeout(_) => self.config.max_timeout_retries,
                                _ => max_retries,
                            };
                            if attempt <= limit {
                                std::thread::sleep(Error::backoff_delay(
                                    attempt,
                                    self.config.backoff_base,
                                ));
                                true
                            } else {
                                false
                            }
                        }
                    };

                    if !retry {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Async flavor of [`run`](Self::run); backoff uses the tokio timer.
    pub async fn run_async<T, F, Fut>(
        &self,
        operation: &str,
        trim: Option<Arc<dyn Fn() + Send + Sync>>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;
        let mut trimmed = false;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.logger
                        .report(ErrorEvent::new(&err, operation).with_attempt(attempt));

                    let retry = match err.retry_strategy() {
                        RetryStrategy::NoRetry => false,
                        RetryStrategy::TrimAndRetry => {
                            if trimmed {
                                false
                            } else if let Some(trim) = trim.as_ref() {
                                trim();
                                trimmed = true;
                                true
                            } else {
                                false
                            }
                        }
                        RetryStrategy::Backoff { max_retries } => {
                            let limit = match err {
                                Error::Timeout(_) => self.config.max_timeout_retries,
                                _ => max_retries,
                            };
                            if attempt <= limit {
                                tokio::time::sleep(Error::backoff_delay(
                                    attempt,
                                    self.config.backoff_base,
                                ))
                                .await;
                                true
                            } else {
                                false
                            }
                        }
                    };

                    if !retry {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
