//! Call context - cancellation and deadline propagation.
//!
//! Every handler invocation carries a [`CallContext`]. The hosting
//! server cancels the root context when the client disconnects; a
//! protocol timeout header derives a child context with a deadline.
//! Derived contexts come with a [`CancelGuard`] that releases the
//! derivation when dropped, so the cancel side-effect is never leaked
//! regardless of which path exits the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Code, RpcError};

#[derive(Debug)]
struct ContextState {
    cancelled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
    parent: Option<CallContext>,
}

/// A cancellation scope for one RPC.
///
/// Cheaply cloneable; all clones observe the same cancellation state.
/// Cancellation is cooperative: in-flight Receive/Send operations
/// resolve with an error derived from [`CallContext::error`] and the
/// stream's terminal close still runs.
#[derive(Debug, Clone)]
pub struct CallContext {
    state: Arc<ContextState>,
}

impl CallContext {
    /// Create a root context with no deadline.
    pub fn background() -> Self {
        Self {
            state: Arc::new(ContextState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// Derive a child context that expires after `timeout`.
    ///
    /// The child also dies when `self` is cancelled. The returned
    /// [`CancelGuard`] cancels the child when dropped.
    pub fn with_timeout(&self, timeout: Duration) -> (CallContext, CancelGuard) {
        let deadline = Instant::now() + timeout;
        // An outer deadline that is already tighter wins.
        let deadline = match self.effective_deadline() {
            Some(outer) if outer < deadline => outer,
            _ => deadline,
        };
        let child = CallContext {
            state: Arc::new(ContextState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline: Some(deadline),
                parent: Some(self.clone()),
            }),
        };
        let guard = CancelGuard {
            ctx: child.clone(),
        };
        (child, guard)
    }

    /// Cancel this context and wake all waiters.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    /// The deadline applied to this context, if any (the tightest along
    /// the parent chain).
    pub fn deadline(&self) -> Option<Instant> {
        self.effective_deadline()
    }

    fn effective_deadline(&self) -> Option<Instant> {
        let own = self.state.deadline;
        let inherited = self.state.parent.as_ref().and_then(|p| p.effective_deadline());
        match (own, inherited) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether this context is dead (cancelled, expired, or a dead
    /// parent).
    pub fn is_cancelled(&self) -> bool {
        if self.state.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if let Some(deadline) = self.state.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        match &self.state.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Resolves when the context dies. Safe to call from multiple
    /// tasks.
    pub fn cancelled(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            loop {
                if self.is_cancelled() {
                    return;
                }
                let notified = self.state.notify.notified();
                // Re-check after registering so a concurrent cancel() is
                // not lost.
                if self.is_cancelled() {
                    return;
                }
                // Boxed so the future type stays finite across the parent
                // chain.
                let parent_dead = match &self.state.parent {
                    Some(parent) => parent.cancelled(),
                    None => Box::pin(std::future::pending()),
                };
                match self.state.deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = notified => {}
                            _ = tokio::time::sleep_until(deadline) => return,
                            _ = parent_dead => return,
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = notified => {}
                            _ = parent_dead => return,
                        }
                    }
                }
            }
        })
    }

    /// The terminal status of a dead context, or `None` while live.
    ///
    /// Deadline expiry reports [`Code::DeadlineExceeded`]; explicit
    /// cancellation reports [`Code::Canceled`].
    pub fn error(&self) -> Option<RpcError> {
        if let Some(deadline) = self.effective_deadline() {
            if Instant::now() >= deadline {
                return Some(RpcError::new(Code::DeadlineExceeded, "deadline exceeded"));
            }
        }
        if self.is_cancelled() {
            return Some(RpcError::new(Code::Canceled, "canceled"));
        }
        None
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

/// Releases a derived context on drop.
///
/// Mirrors `defer cancel()`: the dispatcher holds the guard for the
/// whole exchange, so the derivation is released on every exit path,
/// including the one that discards the derived context after a
/// malformed timeout header.
#[derive(Debug)]
pub struct CancelGuard {
    ctx: CallContext,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}
