//! Cancellation and deadlines for a single import.
//!
//! A [`CancelToken`] is cheap to clone and is shared by every stage of one
//! import. It fires either when [`CancelToken::cancel`] is called or when its
//! deadline passes. Waits performed through the token wake up immediately on
//! cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, Receiver, Sender};

use crate::error::{Error, Result};

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    // Dropping the sender disconnects `wake`, which wakes every waiter.
    trigger: Mutex<Option<Sender<()>>>,
    wake: Receiver<()>,
}

/// Cancellation signal with an optional deadline.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a token without a deadline.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a token that fires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Instant::now().checked_add(timeout))
    }

    /// Create a token that fires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    fn build(deadline: Option<Instant>) -> Self {
        let (trigger, wake) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline,
                trigger: Mutex::new(Some(trigger)),
                wake,
            }),
        }
    }

    /// Cancel the import. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut trigger) = self.inner.trigger.lock() {
            trigger.take();
        }
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline. Zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// True once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Return [`Error::Cancelled`] if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with [`Error::Cancelled`] if the
    /// token fires first.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;

        let deadline = match self.inner.deadline {
            Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
            None => never(),
        };
        let timer = after(duration);

        select! {
            recv(self.inner.wake) -> _ => Err(Error::Cancelled),
            recv(deadline) -> _ => Err(Error::Cancelled),
            recv(timer) -> _ => self.check(),
        }
    }
}
