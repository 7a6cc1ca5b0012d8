//! Cancellable pauses between retry attempts and readiness polls
//!
//! Every suspension in kmutate goes through [`Backoff::wait`], which sleeps
//! for the policy's delay but returns early when the overall deadline is
//! reached or the [`CancelToken`] fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use kmutate_core::RetryPolicy;

/// Cooperative cancellation signal shared between a caller and running loops
///
/// Cloning yields a handle to the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal; every current and future wait returns promptly
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What the loop should do after a pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pause {
    /// Try again
    Retry,
    /// Attempt budget or deadline used up
    Exhausted,
    /// Cancel token fired
    Cancelled,
}

/// Attempt counter and deadline tracker for one retry loop
pub(crate) struct Backoff<'a> {
    policy: &'a RetryPolicy,
    cancel: Option<&'a CancelToken>,
    started: Instant,
    deadline: Option<Instant>,
    attempts: u32,
}

impl<'a> Backoff<'a> {
    pub(crate) fn new(policy: &'a RetryPolicy, cancel: Option<&'a CancelToken>) -> Self {
        let started = Instant::now();
        Self {
            policy,
            cancel,
            started,
            deadline: policy.timeout.map(|timeout| started + timeout),
            attempts: 0,
        }
    }

    /// Record the start of an attempt and return its 1-based number
    pub(crate) fn next_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }

    /// Pause after a failed attempt
    ///
    /// Never sleeps past the deadline: if the delay would overrun it, sleeps
    /// until the deadline and reports `Exhausted`.
    pub(crate) async fn wait(&mut self) -> Pause {
        if self.policy.attempts_exhausted(self.attempts) {
            return Pause::Exhausted;
        }
        if self.is_cancelled() {
            return Pause::Cancelled;
        }

        let wake = Instant::now() + self.policy.delay_for(self.attempts);
        let (until, at_deadline) = match self.deadline {
            Some(deadline) if deadline <= wake => (deadline, true),
            _ => (wake, false),
        };

        let sleep = tokio::time::sleep_until(until);
        match self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Pause::Cancelled,
                    _ = sleep => {}
                }
            }
            None => sleep.await,
        }

        if at_deadline {
            Pause::Exhausted
        } else {
            Pause::Retry
        }
    }
}
