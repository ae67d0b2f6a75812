// Retry policy with exponential/fixed backoff, jitter and cancellation
//
// A policy instance tracks one active run at a time. Starting a new run
// cancels the previous one ("last call wins"), and `cancel()` aborts the
// active run even while it is sleeping between attempts. Cancellation is
// reported as `RetryError::Cancelled`, never as the task's own error.

use crate::streaming::types::StreamError;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// base * 2^(attempt-1), capped at max_delay
    #[default]
    Exponential,
    /// Constant base delay
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryOptions {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    /// Symmetric jitter as a fraction of the computed delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: Backoff::default(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Passed to the task on every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Retry cancelled")]
    Cancelled,

    /// Last real error from the task (retries exhausted or not retryable)
    #[error("{0}")]
    Failed(E),
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    pub fn into_failure(self) -> Option<E> {
        match self {
            RetryError::Failed(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Errors that know whether they are timeout-class
pub trait Retryable {
    fn is_timeout(&self) -> bool;
}

impl Retryable for StreamError {
    fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout(_))
    }
}

pub struct RetryPolicy {
    options: RetryOptions,
    active: Mutex<CancellationToken>,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            active: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Abort the active run, including any pending inter-attempt delay
    pub fn cancel(&self) {
        self.active.lock().cancel();
    }

    fn begin_run(&self) -> CancellationToken {
        let mut active = self.active.lock();
        active.cancel();
        *active = CancellationToken::new();
        active.clone()
    }

    /// Delay before the attempt following `attempt`
    ///
    /// `jitter_unit` in [-1, 1] scales the symmetric jitter.
    pub fn delay_for_attempt(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let base = self.options.base_delay_ms as f64;
        let max = self.options.max_delay_ms as f64;

        let raw = match self.options.backoff {
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(62) as i32;
                (base * 2f64.powi(exponent)).min(max).max(base)
            }
            Backoff::Fixed => base,
        };

        let ratio = if self.options.jitter_ratio.is_finite() {
            self.options.jitter_ratio.max(0.0)
        } else {
            0.0
        };
        let unit = if jitter_unit.is_finite() {
            jitter_unit.clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let delay = (raw + raw * ratio * unit).clamp(0.0, max);
        Duration::from_millis(delay.round() as u64)
    }

    fn sample_delay(&self, attempt: u32) -> Duration {
        let unit = if self.options.jitter_ratio > 0.0 {
            rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_for_attempt(attempt, unit)
    }

    /// Run `task`, retrying timeout-class failures
    pub async fn run<T, E, F, Fut>(&self, task: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(task, |error: &E, _ctx: &RetryContext| error.is_timeout())
            .await
    }

    /// Run `task`, retrying failures accepted by `should_retry`
    pub async fn run_with<T, E, F, Fut, P>(
        &self,
        mut task: F,
        mut should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E, &RetryContext) -> bool,
    {
        let token = self.begin_run();
        let started = Instant::now();
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let ctx = RetryContext {
                attempt,
                max_attempts,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };

            let outcome = tokio::select! {
                biased;

                _ = token.cancelled() => {
                    log::debug!("Retry run cancelled during attempt {}", attempt);
                    return Err(RetryError::Cancelled);
                }

                outcome = task(ctx) => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= max_attempts || !should_retry(&error, &ctx) {
                return Err(RetryError::Failed(error));
            }

            let delay = self.sample_delay(attempt);
            log::warn!(
                "Attempt {}/{} failed: {}; retrying in {} ms",
                attempt,
                max_attempts,
                error,
                delay.as_millis()
            );

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    log::debug!("Retry run cancelled while waiting after attempt {}", attempt);
                    return Err(RetryError::Cancelled);
                }

                _ = sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryOptions::default())
    }
}
