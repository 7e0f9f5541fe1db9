//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Bounded-wait mutual exclusion
//!
//! [`TimedLock`] owns the value it guards and hands out a [`TimedGuard`] that
//! releases the lock when dropped, on every exit path including `?` returns
//! and panics. Acquisition fails with [`LockError::Timeout`] instead of
//! blocking forever.
//!
//! # Reentrancy
//!
//! Locks are strictly non-reentrant. A thread that already holds a lock and
//! asks for it again receives [`LockError::Reentrant`] immediately rather than
//! waiting out the timeout against itself.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use threadpulse_core::lock::TimedLock;
//!
//! let counter = TimedLock::new("counter", 0u32);
//! {
//!     let mut guard = counter.lock_for(Duration::from_millis(100)).unwrap();
//!     *guard += 1;
//! } // released here
//! assert_eq!(*counter.lock().unwrap(), 1);
//! ```

#![forbid(unsafe_code)]

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

#[cfg(feature = "tracing")]
use tracing::{trace, warn};

/// Default time to wait for exclusive access.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of acquisition attempts made by [`TimedLock::lock_with_retry`].
pub const DEFAULT_LOCK_RETRIES: u32 = 5;

/// Errors raised while acquiring a [`TimedLock`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Exclusive access was not obtained within the timeout
    #[error("timed out after {waited:?} waiting for lock on `{owner}`")]
    Timeout {
        /// Label of the contended lock
        owner: String,
        /// Time spent waiting before giving up
        waited: Duration,
    },

    /// The calling thread already holds this lock
    #[error("lock on `{owner}` is already held by the current thread")]
    Reentrant {
        /// Label of the lock
        owner: String,
    },
}

impl LockError {
    /// Returns `true` for contention timeouts, which are worth retrying.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

// Never zero; zero marks an unheld lock
#[inline]
fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Mutual exclusion primitive that gives up after a bounded wait
pub struct TimedLock<T> {
    owner: String,
    default_timeout: Duration,
    holder: AtomicU64,
    timeouts: AtomicU64,
    data: Mutex<T>,
}

impl<T> TimedLock<T> {
    /// Creates a lock labelled `owner` using [`DEFAULT_LOCK_TIMEOUT`].
    pub fn new(owner: impl Into<String>, value: T) -> Self {
        Self::with_timeout(owner, value, DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates a lock with an explicit default timeout.
    pub fn with_timeout(owner: impl Into<String>, value: T, timeout: Duration) -> Self {
        Self {
            owner: owner.into(),
            default_timeout: timeout,
            holder: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            data: Mutex::new(value),
        }
    }

    /// Label used in diagnostics.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Timeout applied by [`lock`](Self::lock).
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of acquisitions that timed out so far.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Acquires the lock using the default timeout.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if the lock stays contended, [`LockError::Reentrant`]
    /// if the current thread already holds it.
    pub fn lock(&self) -> Result<TimedGuard<'_, T>, LockError> {
        self.lock_for(self.default_timeout)
    }

    /// Acquires the lock, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// See [`lock`](Self::lock).
    pub fn lock_for(&self, timeout: Duration) -> Result<TimedGuard<'_, T>, LockError> {
        let token = current_thread_token();
        if self.holder.load(Ordering::Acquire) == token {
            return Err(LockError::Reentrant {
                owner: self.owner.clone(),
            });
        }

        let started = Instant::now();
        match self.data.try_lock_for(timeout) {
            Some(guard) => {
                self.holder.store(token, Ordering::Release);

                #[cfg(feature = "tracing")]
                trace!(owner = %self.owner, waited_us = started.elapsed().as_micros() as u64, "Lock acquired");

                Ok(TimedGuard { lock: self, guard })
            }
            None => {
                let waited = started.elapsed();
                self.timeouts.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "tracing")]
                warn!(owner = %self.owner, waited_ms = waited.as_millis() as u64, "Lock acquisition timed out");

                #[cfg(feature = "metrics")]
                ::metrics::counter!("threadpulse_lock_timeouts_total", "owner" => self.owner.clone()).increment(1);

                Err(LockError::Timeout {
                    owner: self.owner.clone(),
                    waited,
                })
            }
        }
    }

    /// Acquires the lock, retrying timeouts up to `attempts` times.
    ///
    /// Reentrancy errors are returned immediately since retrying cannot help.
    ///
    /// # Errors
    ///
    /// The last [`LockError`] once every attempt has failed.
    pub fn lock_with_retry(
        &self,
        timeout: Duration,
        attempts: u32,
    ) -> Result<TimedGuard<'_, T>, LockError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.lock_for(timeout) {
                Ok(guard) => return Ok(guard),
                Err(err) if err.is_timeout() && attempt < attempts => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(owner = %self.owner, attempt, attempts, "Retrying contended lock");

                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Attempts the lock without waiting.
    pub fn try_lock(&self) -> Option<TimedGuard<'_, T>> {
        let token = current_thread_token();
        if self.holder.load(Ordering::Acquire) == token {
            return None;
        }
        self.data.try_lock().map(|guard| {
            self.holder.store(token, Ordering::Release);
            TimedGuard { lock: self, guard }
        })
    }

    /// Whether any thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.data.is_locked()
    }

    /// Whether the calling thread is the current holder.
    pub fn held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Acquire) == current_thread_token()
    }

    /// Mutable access without locking; exclusive borrow proves no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock and returns the guarded value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> fmt::Debug for TimedLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedLock")
            .field("owner", &self.owner)
            .field("default_timeout", &self.default_timeout)
            .field("locked", &self.is_locked())
            .field("timeouts", &self.timeout_count())
            .finish()
    }
}

/// Scoped exclusive access to the value inside a [`TimedLock`]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct TimedGuard<'a, T> {
    lock: &'a TimedLock<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> TimedGuard<'_, T> {
    /// Label of the lock this guard holds.
    pub fn owner(&self) -> &str {
        &self.lock.owner
    }
}

impl<T> fmt::Debug for TimedGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedGuard").field("owner", &self.lock.owner).finish_non_exhaustive()
    }
}

impl<T> Deref for TimedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TimedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TimedGuard<'_, T> {
    fn drop(&mut self) {
        // Cleared before the inner guard unlocks
        self.lock.holder.store(0, Ordering::Release);
    }
}
