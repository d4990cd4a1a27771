//! Retry logic with exponential backoff for transient transport errors.
//!
//! Only [`Error::is_retryable`] errors are retried. A command that ran and
//! exited non-zero comes back as `Ok(ExecOutput)` and is never retried.

use crate::context::ExecContext;
use crate::error::{Error, Result};
use crate::types::RetryConfig;
use std::thread;
use std::time::{Duration, Instant};

/// How often a backoff sleep wakes up to look at the cancellation flag.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Notified before each backoff sleep.
pub trait RetryCallback {
    /// `attempt` is the 1-indexed attempt that just failed.
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration);
}

/// Callback that logs retries at warn level.
pub struct LogCallback<'a> {
    /// What is being retried, e.g. "ssh gpu-box"
    pub operation: &'a str,
}

impl RetryCallback for LogCallback<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration) {
        log::warn!(
            "{}: attempt {}/{} failed: {}. Retrying in {:.1}s",
            self.operation,
            attempt,
            max_attempts,
            error,
            delay.as_secs_f64()
        );
    }
}

/// Execute an operation with retry logic.
///
/// Retries the operation if it returns a retryable error, using exponential
/// backoff between attempts. Cancellation or an expired deadline stops the
/// loop immediately, including in the middle of a backoff sleep.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    ctx: &ExecContext,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_error: Option<Error> = None;

    for attempt in 0..config.max_attempts.max(1) {
        ctx.check()?;

        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                if attempt + 1 >= config.max_attempts {
                    last_error = Some(e);
                    break;
                }

                let delay = config.delay_for_attempt(attempt);
                if let Some(cb) = callback {
                    cb.on_retry(attempt + 1, config.max_attempts, &e, delay);
                }

                sleep_unless_cancelled(ctx, delay)?;
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Other("retry exhausted".to_string())))
}

fn sleep_unless_cancelled(ctx: &ExecContext, delay: Duration) -> Result<()> {
    let until = Instant::now() + delay;
    loop {
        ctx.check()?;
        let now = Instant::now();
        if now >= until {
            return Ok(());
        }
        thread::sleep(CANCEL_POLL.min(until - now));
    }
}
