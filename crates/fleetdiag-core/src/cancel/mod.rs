//! Cancellation primitives for collection jobs.
//!
//! A [`CancelToken`] threads through the whole collection pipeline: the job
//! controller holds the root token, the orchestrator and every fetcher worker
//! observe it, and collector readers are wrapped so that streaming copies
//! terminate promptly once the token fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

/// Upper bound used for select timeouts when a token carries no deadline.
const NO_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Reason a token is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    /// The token was canceled explicitly.
    #[error("context canceled")]
    Canceled,

    /// The token's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Shared cancellation state.
#[derive(Debug)]
struct Shared {
    canceled: AtomicBool,
    /// Dropped on cancel so that every clone of `done` wakes up.
    gate: Mutex<Option<Sender<()>>>,
}

/// A cancellation token with an optional deadline.
///
/// Clones share the cancel signal. [`CancelToken::child_with_timeout`]
/// derives a token with a tighter deadline that still observes the parent's
/// explicit cancel.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
    done: Receiver<()>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Create a token without a deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    /// Create a token that reports [`CancelError::DeadlineExceeded`] once
    /// `timeout` has elapsed.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now().checked_add(timeout))
    }

    fn with_deadline(deadline: Option<Instant>) -> Self {
        let (tx, rx) = bounded(0);
        Self {
            shared: Arc::new(Shared {
                canceled: AtomicBool::new(false),
                gate: Mutex::new(Some(tx)),
            }),
            done: rx,
            deadline,
        }
    }

    /// Derive a token with a deadline of `min(parent deadline, now + timeout)`.
    ///
    /// Canceling the parent cancels the child; the child carries no
    /// independent cancel authority.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, child_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            shared: Arc::clone(&self.shared),
            done: self.done.clone(),
            deadline,
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::SeqCst);
        // Dropping the sender closes the channel, waking all `done` waiters.
        if let Ok(mut gate) = self.shared.gate.lock() {
            gate.take();
        }
    }

    /// Why the token is done, if it is.
    ///
    /// An explicit cancel takes precedence over an elapsed deadline.
    #[must_use]
    pub fn err(&self) -> Option<CancelError> {
        if self.shared.canceled.load(Ordering::SeqCst) {
            return Some(CancelError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(CancelError::DeadlineExceeded)
            }
            _ => None,
        }
    }

    /// Whether the token has fired (canceled or past its deadline).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Channel that becomes ready when the token is canceled explicitly.
    ///
    /// Use together with [`CancelToken::time_left`] in `select!` loops so
    /// that both cancelation and deadlines are observed.
    #[must_use]
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }

    /// Time remaining until the deadline, or a very large duration when the
    /// token has none. Suitable for `select!` timeout arms.
    #[must_use]
    pub fn time_left(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => NO_DEADLINE,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_not_done() {
        let token = CancelToken::new();
        assert_eq!(token.err(), None);
        assert!(!token.is_done());
    }

    #[test]
    fn test_cancel_wakes_done_waiters() {
        let token = CancelToken::new();
        let done = token.done().clone();
        token.cancel();

        assert_eq!(token.err(), Some(CancelError::Canceled));
        // A closed channel returns an error immediately instead of blocking.
        assert!(done.recv().is_err());
    }

    #[test]
    fn test_deadline_reports_deadline_exceeded() {
        let token = CancelToken::with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(token.err(), Some(CancelError::DeadlineExceeded));
    }

    #[test]
    fn test_explicit_cancel_wins_over_deadline() {
        let token = CancelToken::with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        token.cancel();
        assert_eq!(token.err(), Some(CancelError::Canceled));
    }

    #[test]
    fn test_child_inherits_parent_cancel() {
        let parent = CancelToken::new();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.err(), Some(CancelError::Canceled));
    }

    #[test]
    fn test_child_deadline_is_tighter_than_parent() {
        let parent = CancelToken::with_timeout(Duration::from_secs(3600));
        let child = parent.child_with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(child.err(), Some(CancelError::DeadlineExceeded));
        assert_eq!(parent.err(), None);
    }
}
