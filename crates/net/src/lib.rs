//! Connection-handling primitives for the agent daemon.
//!
//! - [`Latch`]: a signal-safe wake flag.
//! - [`EventSet`]: a fixed-capacity readiness multiplexer over the host's
//!   preferred facility (epoll, kqueue, poll or Windows event objects).
//! - [`OwnerSentinel`]: lets a forked child notice its owner exiting.
//! - [`listener`]: opens one listening socket per resolved address.

pub mod event;
pub mod latch;
#[cfg(unix)]
pub mod listener;
#[cfg(unix)]
pub mod sentinel;

pub use event::{BackendKind, EventSet, Interest, WaitEvent};
pub use latch::Latch;
#[cfg(unix)]
pub use listener::{
    listen, Accepted, AcceptedStream, AddressFamily, BoundAddress, ListenAddress, ListenError,
    ListenOptions, ListeningSocket, MAX_LISTEN_SOCKETS,
};
#[cfg(unix)]
pub use sentinel::OwnerSentinel;

/// Native handle type registered with an [`EventSet`].
#[cfg(unix)]
pub type Descriptor = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type Descriptor = std::os::windows::io::RawSocket;

#[cfg(unix)]
pub(crate) mod sys {
    use std::io;
    use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

    pub(crate) fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc)
        }
    }

    pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
        let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
        Ok(())
    }

    pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
        let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        let wanted = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if wanted != flags {
            cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, wanted) })?;
        }
        Ok(())
    }

    /// Anonymous pipe with both ends close-on-exec and non-blocking.
    pub(crate) fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as libc::c_int; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [fds[0], fds[1]] {
            set_cloexec(fd)?;
            set_nonblocking(fd, true)?;
        }
        Ok((read, write))
    }

    /// Read and discard everything currently buffered in a non-blocking pipe.
    /// Returns `false` once the write side has been closed.
    pub(crate) fn drain_pipe(fd: RawFd) -> bool {
        let mut scratch = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(
                    fd,
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if rc > 0 {
                continue;
            }
            if rc == 0 {
                return false;
            }
            match io::Error::last_os_error().kind() {
                io::ErrorKind::Interrupted => continue,
                _ => return true,
            }
        }
    }
}
