use std::io;
use std::os::unix::io::RawFd;

use super::{Backend, Ready, Registration};
use crate::sys::cvt;

/// Portable fallback: one `pollfd` per position, rebuilt only on change.
pub(crate) struct PollBackend {
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity),
        }
    }
}

fn to_pollfd(reg: &Registration) -> libc::pollfd {
    let mut events: libc::c_short = 0;
    if reg.wants_read() {
        events |= libc::POLLIN;
    }
    if reg.wants_write() {
        events |= libc::POLLOUT;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if reg.wants_close() {
        events |= libc::POLLRDHUP;
    }
    libc::pollfd {
        // poll(2) skips negative descriptors, which keeps an unattached latch
        // slot in place.
        fd: reg.descriptor().unwrap_or(-1),
        events,
        revents: 0,
    }
}

impl Backend for PollBackend {
    fn register(&mut self, reg: &Registration) -> io::Result<()> {
        debug_assert_eq!(reg.position, self.fds.len());
        self.fds.push(to_pollfd(reg));
        Ok(())
    }

    fn reregister(&mut self, reg: &Registration, _previous: Option<RawFd>) -> io::Result<()> {
        self.fds[reg.position] = to_pollfd(reg);
        Ok(())
    }

    fn poll(
        &mut self,
        _registrations: &[Registration],
        timeout_ms: i32,
        max_events: usize,
        ready: &mut Vec<Ready>,
    ) -> io::Result<()> {
        for fd in &mut self.fds {
            fd.revents = 0;
        }
        let rc = cvt(unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        })?;
        if rc == 0 {
            return Ok(());
        }

        for (position, fd) in self.fds.iter().enumerate() {
            if ready.len() >= max_events {
                break;
            }
            let revents = fd.revents;
            if revents == 0 {
                continue;
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let read_closed = revents & libc::POLLRDHUP != 0;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let read_closed = false;

            ready.push(Ready {
                position,
                readable: revents & libc::POLLIN != 0,
                writable: revents & libc::POLLOUT != 0,
                read_closed,
                hangup: revents & libc::POLLHUP != 0,
                error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(())
    }
}
