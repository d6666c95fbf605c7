//! Retry executor: drives a task to success, attempt exhaustion, or
//! cancellation, waiting out the configured backoff between attempts.

use super::backoff::BackoffPolicy;
use super::cancel::{CancelHandle, Cancelled};
use anyhow::Result;
use std::future::Future;
use tokio::time::sleep;

/// Parameters for one [`retry`] invocation. `name` tags every log line so
/// concurrent retry loops stay distinguishable.
#[derive(Clone, Copy)]
pub struct RetryOptions<'a> {
    pub name: &'a str,
    pub policy: BackoffPolicy,
    pub max_attempts: Option<usize>,
    pub cancel: Option<&'a CancelHandle>,
}

impl<'a> RetryOptions<'a> {
    pub fn new(name: &'a str, policy: BackoffPolicy) -> Self {
        Self {
            name,
            policy,
            max_attempts: None,
            cancel: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Invokes `operation` until it succeeds. Failures wait out the policy's
/// delay and try again, up to `max_attempts`; exhaustion re-raises the last
/// failure. A cancellation — observed before an attempt, during the wait,
/// or surfacing from the operation itself — aborts immediately and is never
/// retried.
pub async fn retry<T, F, Fut>(options: RetryOptions<'_>, mut operation: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        if let Some(cancel) = options.cancel {
            if cancel.is_aborted() {
                return Err(Cancelled.into());
            }
        }

        attempt += 1;
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(task = options.name, attempt, "task recovered after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                if Cancelled::caused(&err) {
                    return Err(err);
                }

                let exhausted = options
                    .max_attempts
                    .map(|max| attempt >= max)
                    .unwrap_or(false);
                if exhausted {
                    tracing::error!(
                        task = options.name,
                        attempt,
                        error = %err,
                        "task exhausted retries"
                    );
                    return Err(err);
                }

                let backoff = options.policy.delay(attempt);
                tracing::warn!(
                    task = options.name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "task failed; retrying"
                );

                match options.cancel {
                    Some(cancel) => cancel.sleep(backoff).await.map_err(anyhow::Error::new)?,
                    None => sleep(backoff).await,
                }
            }
        }
    }
}
