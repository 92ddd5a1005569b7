//! Cooperative cancellation.
//!
//! The scheduler polls an [`ExecutionControl`] between chunk dispatches. A
//! cancelled or overdue run still synchronizes every stream and releases
//! every resource before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CancelReason;

/// Shared flag a caller can trigger from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Cancellation and deadline for one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionControl {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl ExecutionControl {
    /// No cancellation, no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Stop dispatching once `deadline` has passed.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stop dispatching once `timeout` has elapsed from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The advisory deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why dispatch should stop now, if it should.
    pub fn check(&self) -> Option<CancelReason> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some(CancelReason::Requested);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(CancelReason::DeadlineExceeded);
        }
        None
    }
}
