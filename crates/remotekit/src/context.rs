//! Cancellation and deadline context passed to every executor call.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared cancellation flag.
///
/// Cloning shares the flag; cancelling any clone cancels them all.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Execution context: cancellation token plus an optional deadline.
#[derive(Clone, Debug)]
pub struct ExecContext {
    cancel: CancelToken,
    started: Instant,
    deadline: Option<Instant>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new(CancelToken::new())
    }
}

impl ExecContext {
    /// Context driven by the given token, with no deadline.
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            started: Instant::now(),
            deadline: None,
        }
    }

    /// Same token, with a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// A context that ignores cancellation and has no deadline.
    ///
    /// Mutating scripts run under this so an in-flight package manager is
    /// never killed halfway; callers check [`is_cancelled`](Self::is_cancelled)
    /// on the parent between scripts.
    pub fn detached(&self) -> Self {
        Self::new(CancelToken::new())
    }

    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if cancelled or past the deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::DeadlineExceeded {
                elapsed: self.started.elapsed(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let ctx = ExecContext::default();
        let other = ctx.clone();
        assert!(ctx.check().is_ok());

        other.token().cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_detached_ignores_parent_cancel() {
        let ctx = ExecContext::default().with_timeout(Duration::from_secs(60));
        let detached = ctx.detached();
        ctx.token().cancel();

        assert!(detached.check().is_ok());
        assert!(detached.remaining().is_none());
    }

    #[test]
    fn test_deadline_exceeded() {
        let ctx = ExecContext::default().with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(Error::DeadlineExceeded { .. })));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }
}
