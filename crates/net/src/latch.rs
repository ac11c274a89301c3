//! Single-bit wake flag.
//!
//! Any thread or signal handler may [`Latch::set`] a latch; only the process
//! that created it may [`Latch::reset`] it or wait on it through an
//! [`EventSet`](crate::EventSet). The usual pattern is:
//!
//! ```ignore
//! loop {
//!     latch.reset();
//!     if work_to_do() { do_work(); }
//!     events.wait(None, &mut out, 4)?;
//! }
//! ```
//!
//! Resetting before checking for work means a `set` that races with the
//! check is never lost: it either lands before the reset-then-check (and the
//! work is seen) or after it (and the wait returns immediately).

use std::io;
use std::sync::atomic::{fence, AtomicBool, Ordering};

pub struct Latch {
    is_set: AtomicBool,
    maybe_sleeping: AtomicBool,
    owner_pid: u32,
    waker: Waker,
}

impl Latch {
    /// Create a latch owned by the calling process, initially not set.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            is_set: AtomicBool::new(false),
            maybe_sleeping: AtomicBool::new(false),
            owner_pid: std::process::id(),
            waker: Waker::new()?,
        })
    }

    /// Mark the latch set and wake the owner if it may be blocked.
    ///
    /// Async-signal-safe: touches only atomics and, at most, one `write(2)`
    /// (or `SetEvent` on Windows).
    pub fn set(&self) {
        // Whatever the caller did before setting must be visible to the
        // process that observes the latch.
        fence(Ordering::SeqCst);

        if self.is_set.load(Ordering::Relaxed) {
            return;
        }
        self.is_set.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if !self.maybe_sleeping.load(Ordering::SeqCst) {
            return;
        }
        self.waker.wake();
    }

    /// Clear the latch.
    ///
    /// # Panics
    /// If called from a process other than the owner, or while a wait on this
    /// latch is in progress.
    pub fn reset(&self) {
        assert!(
            self.is_owned_by_current_process(),
            "latch owned by pid {} reset from pid {}",
            self.owner_pid,
            std::process::id()
        );
        assert!(
            !self.maybe_sleeping.load(Ordering::SeqCst),
            "latch reset while a wait on it is in progress"
        );

        self.is_set.store(false, Ordering::Relaxed);
        // Order the clear before any subsequent check of the condition the
        // latch guards.
        fence(Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::SeqCst)
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn is_owned_by_current_process(&self) -> bool {
        self.owner_pid == std::process::id()
    }

    /// Announce that the owner is about to block. Must be followed by a
    /// fresh `is_set` check before the blocking call.
    pub(crate) fn begin_sleep(&self) {
        self.maybe_sleeping.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    pub(crate) fn end_sleep(&self) {
        self.maybe_sleeping.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_sleeping(&self) -> bool {
        self.maybe_sleeping.load(Ordering::SeqCst)
    }

    /// Consume pending wake-ups so the next wait can block again.
    pub(crate) fn drain(&self) {
        self.waker.drain();
    }

    #[cfg(unix)]
    pub(crate) fn wake_fd(&self) -> std::os::unix::io::RawFd {
        self.waker.read_fd()
    }

    #[cfg(windows)]
    pub(crate) fn wake_handle(&self) -> windows_sys::Win32::Foundation::HANDLE {
        self.waker.event
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("is_set", &self.is_set.load(Ordering::Relaxed))
            .field("maybe_sleeping", &self.maybe_sleeping.load(Ordering::Relaxed))
            .field("owner_pid", &self.owner_pid)
            .finish()
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

        /// Self-pipe: the read end is what the event set watches.
        struct Waker {
            read: OwnedFd,
            write: OwnedFd,
        }

        impl Waker {
            fn new() -> io::Result<Self> {
                let (read, write) = crate::sys::nonblocking_pipe()?;
                Ok(Self { read, write })
            }

            fn wake(&self) {
                let byte = 0u8;
                loop {
                    let rc = unsafe {
                        libc::write(
                            self.write.as_raw_fd(),
                            &byte as *const u8 as *const libc::c_void,
                            1,
                        )
                    };
                    if rc >= 0 {
                        return;
                    }
                    // EAGAIN means the pipe is full, so a wake-up is already
                    // pending. Anything else is not recoverable from here.
                    if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                        return;
                    }
                }
            }

            fn drain(&self) {
                crate::sys::drain_pipe(self.read.as_raw_fd());
            }

            fn read_fd(&self) -> RawFd {
                self.read.as_raw_fd()
            }
        }
    } else if #[cfg(windows)] {
        use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
        use windows_sys::Win32::System::Threading::{CreateEventW, ResetEvent, SetEvent};

        /// Manual-reset event object.
        struct Waker {
            event: HANDLE,
        }

        // SAFETY: event handles may be signalled and waited on from any thread.
        unsafe impl Send for Waker {}
        unsafe impl Sync for Waker {}

        impl Waker {
            fn new() -> io::Result<Self> {
                let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
                if event.is_null() {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { event })
            }

            fn wake(&self) {
                unsafe {
                    SetEvent(self.event);
                }
            }

            fn drain(&self) {
                unsafe {
                    ResetEvent(self.event);
                }
            }
        }

        impl Drop for Waker {
            fn drop(&mut self) {
                unsafe {
                    CloseHandle(self.event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_latch_is_clear_and_owned() {
        let latch = Latch::new().expect("latch");
        assert!(!latch.is_set());
        assert!(latch.is_owned_by_current_process());
        assert_eq!(latch.owner_pid(), std::process::id());
    }

    #[test]
    fn set_then_reset() {
        let latch = Latch::new().expect("latch");
        latch.set();
        assert!(latch.is_set());
        latch.set();
        assert!(latch.is_set());
        latch.reset();
        assert!(!latch.is_set());
    }

    #[test]
    fn set_from_another_thread_is_visible() {
        let latch = Arc::new(Latch::new().expect("latch"));
        let remote = Arc::clone(&latch);
        thread::spawn(move || remote.set())
            .join()
            .expect("setter thread");
        assert!(latch.is_set());
    }

    #[test]
    #[should_panic(expected = "in progress")]
    fn reset_while_sleeping_panics() {
        let latch = Latch::new().expect("latch");
        latch.begin_sleep();
        latch.reset();
    }

    #[cfg(unix)]
    #[test]
    fn only_a_sleeping_owner_gets_a_pipe_write() {
        fn read_one(fd: RawFd) -> isize {
            let mut byte = 0u8;
            unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) }
        }

        let latch = Latch::new().expect("latch");
        latch.set();
        assert_eq!(read_one(latch.wake_fd()), -1);

        latch.reset();
        latch.begin_sleep();
        assert!(latch.is_sleeping());
        latch.set();
        latch.end_sleep();
        assert_eq!(read_one(latch.wake_fd()), 1);
    }
}
