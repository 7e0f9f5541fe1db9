//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Cooperative cancellation token
//!
//! Cancelling drops the only sender of an internal crossbeam channel, so every
//! thread blocked in [`CancellationToken::wait`] sees the disconnect and wakes
//! at once instead of sleeping out its interval.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

struct TokenInner {
    cancelled: AtomicBool,
    deadline: Mutex<Option<Instant>>,
    waker: Mutex<Option<Sender<()>>>,
    sleeper: Receiver<()>,
}

/// Shared cancellation flag with an optional deadline
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled and has no deadline.
    #[must_use]
    pub fn new() -> Self {
        let (waker, sleeper) = channel::bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                deadline: Mutex::new(None),
                waker: Mutex::new(Some(waker)),
                sleeper,
            }),
        }
    }

    /// Marks the token cancelled and wakes every waiter. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.waker.lock().take();
        }
    }

    /// Cancels automatically once `deadline` passes.
    ///
    /// An earlier deadline already set is kept.
    pub fn cancel_at(&self, deadline: Instant) {
        let mut current = self.inner.deadline.lock();
        *current = Some(match *current {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        });
    }

    /// Cancels automatically after `timeout`.
    pub fn cancel_after(&self, timeout: Duration) {
        self.cancel_at(Instant::now() + timeout);
    }

    /// Deadline set by [`cancel_at`](Self::cancel_at), if any.
    pub fn deadline(&self) -> Option<Instant> {
        *self.inner.deadline.lock()
    }

    /// Whether cancellation was requested or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.deadline() {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel();
                true
            }
            _ => false,
        }
    }

    /// Sleeps up to `timeout`, returning early on cancellation.
    ///
    /// Returns `true` if the token is cancelled when the wait ends.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }

        let timeout = match self.deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        };

        match self.inner.sleeper.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Ok(()) | Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.inner.cancelled.load(Ordering::Relaxed))
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn test_wait_times_out() {
        let token = CancellationToken::new();
        let started = Instant::now();
        assert!(!token.wait(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let cancelled = token.wait(Duration::from_secs(10));
                (cancelled, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, waited) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_deadline_cancels() {
        let token = CancellationToken::new();
        token.cancel_after(Duration::from_millis(15));
        assert!(token.deadline().is_some());

        let started = Instant::now();
        assert!(token.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let token = CancellationToken::new();
        let soon = Instant::now() + Duration::from_millis(10);
        token.cancel_at(soon);
        token.cancel_at(soon + Duration::from_secs(60));
        assert_eq!(token.deadline(), Some(soon));
    }
}
