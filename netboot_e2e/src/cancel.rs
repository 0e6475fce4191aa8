// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cancellation contexts with deadlines.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`CancelContext`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    /// The context, or one of its parents, was explicitly cancelled.
    #[error("cancelled")]
    Cancelled,
    /// The context's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellation scope with an optional deadline.
///
/// Contexts form a tree. A child observes its parent's cancellation and never
/// outlives the parent's deadline, but cancelling a child leaves the parent
/// untouched. Cloning yields a handle to the same context.
#[derive(Debug, Clone)]
pub struct CancelContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelContext {
    /// A new root context that is never cancelled on its own.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A child context that also ends after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(far_future);
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    /// A child context that can be cancelled independently of this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context has ended, or `None` if it is still live.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            Some(CancelReason::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(CancelReason::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Whether the context has ended.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Waits for the context to end.
    pub async fn cancelled(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => CancelReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }

    /// Runs `fut` until it completes or the context ends, whichever is first.
    pub async fn until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        if let Some(reason) = self.reason() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(reason),
            output = fut => Ok(output),
        }
    }

    /// Sleeps for `duration`, returning early with an error if the context
    /// ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
        self.until_cancelled(tokio::time::sleep(duration)).await
    }
}

fn far_future() -> Instant {
    // Roughly 30 years.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_context() {
        let ctx = CancelContext::new().with_timeout(Duration::from_secs(5));
        assert!(!ctx.is_cancelled());
        let r = ctx.until_cancelled(std::future::pending::<()>()).await;
        assert_eq!(r, Err(CancelReason::DeadlineExceeded));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn child_inherits_parent_cancel_but_not_reverse() {
        let parent = CancelContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert_eq!(child.cancelled().await, CancelReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn child_timeout_never_extends_parent_deadline() {
        let parent = CancelContext::new().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
        assert_eq!(
            child.sleep(Duration::from_secs(10)).await,
            Err(CancelReason::DeadlineExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completes_before_deadline() {
        let ctx = CancelContext::new().with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.until_cancelled(async { 7 }).await, Ok(7));
        assert_eq!(ctx.sleep(Duration::from_secs(1)).await, Ok(()));
    }
}
