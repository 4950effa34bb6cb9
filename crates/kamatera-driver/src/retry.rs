//! Bounded retry and cancellable waiting.
//!
//! Every wait in the driver (retry backoff, poll interval) goes through
//! [`Cancellation::sleep`], so a shutdown signal or an overall deadline can
//! abort any flow at its next suspension point.

use std::future::{Future, pending};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

use crate::{Error, Result};

/// Delay before the next attempt, given how many attempts already failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base + failed × step`.
    Linear { base: Duration, step: Duration },
}

impl Backoff {
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match *self {
            Self::Linear { base, step } => base + step * failed_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt cap is reached. `op` receives the 1-based attempt number.
///
/// Exhaustion is reported as [`Error::RetriesExhausted`] wrapping the last
/// error, so the final status and body stay visible.
pub async fn with_retry<T, F, Fut, R>(
    operation: &'static str,
    policy: &RetryPolicy,
    cancel: &Cancellation,
    is_retryable: R,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&Error) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        cancel.check(operation)?;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) if attempt >= attempts => {
                return Err(Error::RetriesExhausted {
                    operation,
                    attempts,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                warn!(operation, attempt, max_attempts = attempts, error = %e, "retrying");
                cancel.sleep(operation, policy.backoff.delay(attempt)).await?;
                attempt += 1;
            }
        }
    }
}

/// Shutdown signal and/or deadline threaded through every wait.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    shutdown: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// Never cancels.
    pub fn none() -> Self {
        Self::default()
    }

    /// Abort when the channel flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Abort at `deadline`, or at the existing deadline if that is earlier.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled { operation });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded { operation });
        }
        Ok(())
    }

    pub async fn sleep(&self, operation: &'static str, duration: Duration) -> Result<()> {
        self.check(operation)?;

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        let shutdown = async {
            match self.shutdown.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        // Sender gone: nobody can cancel any more.
                        pending::<()>().await;
                    }
                },
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = deadline => Err(Error::DeadlineExceeded { operation }),
            _ = shutdown => Err(Error::Cancelled { operation }),
        }
    }
}
