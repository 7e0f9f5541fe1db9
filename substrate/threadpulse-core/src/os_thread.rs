//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// OS thread identity and scheduling priority
#![allow(unsafe_code)] /* OS thread APIs require unsafe */

use std::fmt;
use thiserror::Error;

/// Scheduling priority requested for a supervised thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadPriority {
    /// Runs only when nothing else wants the CPU
    Lowest,
    /// Slightly below normal
    BelowNormal,
    /// The OS default
    #[default]
    Normal,
    /// Slightly above normal
    AboveNormal,
    /// Highest non-realtime priority
    Highest,
}

impl ThreadPriority {
    /// Linux nice value for this priority
    pub fn nice_value(self) -> i32 {
        match self {
            Self::Lowest => 10,
            Self::BelowNormal => 5,
            Self::Normal => 0,
            Self::AboveNormal => -5,
            Self::Highest => -10,
        }
    }
}

impl fmt::Display for ThreadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lowest => "lowest",
            Self::BelowNormal => "below-normal",
            Self::Normal => "normal",
            Self::AboveNormal => "above-normal",
            Self::Highest => "highest",
        };
        f.write_str(name)
    }
}

/// Errors from applying a thread priority
#[derive(Debug, Error)]
pub enum PriorityError {
    /// The platform has no per-thread priority control
    #[error("thread priority {0} is not supported on this platform")]
    NotSupported(ThreadPriority),

    /// The OS refused the change (commonly missing privileges for raised priorities)
    #[error("failed to set thread priority {priority}: {source}")]
    SystemCallFailed {
        /// Requested priority
        priority: ThreadPriority,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}

/// Applies `priority` to the calling thread.
///
/// # Errors
///
/// Returns [`PriorityError`] if the OS rejects the request or cannot express it.
pub fn set_current_thread_priority(priority: ThreadPriority) -> Result<(), PriorityError> {
    imp::set_priority(priority)
}

/// OS identifier of the calling thread, or 0 where none is available.
pub fn current_os_thread_id() -> u64 {
    imp::os_thread_id()
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{PriorityError, ThreadPriority};

    pub(super) fn set_priority(priority: ThreadPriority) -> Result<(), PriorityError> {
        // On Linux the nice value of a tid applies to that thread only
        let tid = os_thread_id();

        // SAFETY: plain syscall on our own thread id
        #[allow(clippy::cast_possible_truncation)]
        let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, priority.nice_value()) };

        if ret == 0 {
            Ok(())
        } else {
            Err(PriorityError::SystemCallFailed {
                priority,
                source: std::io::Error::last_os_error(),
            })
        }
    }

    pub(super) fn os_thread_id() -> u64 {
        // SAFETY: gettid has no arguments and cannot fail
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        #[allow(clippy::cast_sign_loss)]
        let tid = tid as u64;
        tid
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use super::{PriorityError, ThreadPriority};

    pub(super) fn set_priority(priority: ThreadPriority) -> Result<(), PriorityError> {
        match priority {
            ThreadPriority::Normal => Ok(()),
            other => Err(PriorityError::NotSupported(other)),
        }
    }

    pub(super) fn os_thread_id() -> u64 {
        let mut id = 0u64;
        // SAFETY: pthread_self is always valid for the calling thread
        let ret = unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut id) };
        if ret == 0 {
            id
        } else {
            0
        }
    }
}

#[cfg(target_os = "windows")]
mod imp {
    use super::{PriorityError, ThreadPriority};
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, GetCurrentThreadId, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL,
        THREAD_PRIORITY_BELOW_NORMAL, THREAD_PRIORITY_HIGHEST, THREAD_PRIORITY_LOWEST,
        THREAD_PRIORITY_NORMAL,
    };

    pub(super) fn set_priority(priority: ThreadPriority) -> Result<(), PriorityError> {
        let level = match priority {
            ThreadPriority::Lowest => THREAD_PRIORITY_LOWEST,
            ThreadPriority::BelowNormal => THREAD_PRIORITY_BELOW_NORMAL,
            ThreadPriority::Normal => THREAD_PRIORITY_NORMAL,
            ThreadPriority::AboveNormal => THREAD_PRIORITY_ABOVE_NORMAL,
            ThreadPriority::Highest => THREAD_PRIORITY_HIGHEST,
        };

        // SAFETY: pseudo-handle for the current thread, no close needed
        let ret = unsafe { SetThreadPriority(GetCurrentThread(), level) };
        if ret != 0 {
            Ok(())
        } else {
            Err(PriorityError::SystemCallFailed {
                priority,
                source: std::io::Error::last_os_error(),
            })
        }
    }

    pub(super) fn os_thread_id() -> u64 {
        // SAFETY: no preconditions
        u64::from(unsafe { GetCurrentThreadId() })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod imp {
    use super::{PriorityError, ThreadPriority};

    pub(super) fn set_priority(priority: ThreadPriority) -> Result<(), PriorityError> {
        match priority {
            ThreadPriority::Normal => Ok(()),
            other => Err(PriorityError::NotSupported(other)),
        }
    }

    pub(super) fn os_thread_id() -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_priority_always_applies() {
        assert!(set_current_thread_priority(ThreadPriority::Normal).is_ok());
    }

    #[test]
    fn test_lowering_priority_is_permitted() {
        // Lowering never needs privileges; run on a scratch thread so the test
        // runner's thread keeps its priority
        let result = std::thread::spawn(|| set_current_thread_priority(ThreadPriority::Lowest))
            .join()
            .unwrap();

        #[cfg(any(target_os = "linux", target_os = "windows"))]
        assert!(result.is_ok(), "{result:?}");
        #[cfg(not(any(target_os = "linux", target_os = "windows")))]
        assert!(matches!(result, Err(PriorityError::NotSupported(ThreadPriority::Lowest))));
    }

    #[test]
    fn test_thread_ids_differ() {
        let here = current_os_thread_id();
        let there = std::thread::spawn(current_os_thread_id).join().unwrap();

        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
        {
            assert_ne!(here, 0);
            assert_ne!(here, there);
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        let _ = (here, there);
    }

    #[test]
    fn test_nice_values_are_ordered() {
        let order = [
            ThreadPriority::Lowest,
            ThreadPriority::BelowNormal,
            ThreadPriority::Normal,
            ThreadPriority::AboveNormal,
            ThreadPriority::Highest,
        ];
        assert!(order.windows(2).all(|pair| pair[0].nice_value() > pair[1].nice_value()));
        assert_eq!(ThreadPriority::default(), ThreadPriority::Normal);
        assert_eq!(ThreadPriority::AboveNormal.to_string(), "above-normal");
    }
}
