use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::{Backend, Ready, Registration};
use crate::sys::cvt;

pub(crate) struct EpollBackend {
    epoll: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            // SAFETY: epoll_create1 returned a fresh descriptor.
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, reg: Option<&Registration>) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: reg.map_or(0, interest_bits),
            u64: reg.map_or(0, |r| r.position as u64),
        };
        cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }
}

fn interest_bits(reg: &Registration) -> u32 {
    let mut bits = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
    if reg.wants_read() {
        bits |= libc::EPOLLIN as u32;
    }
    if reg.wants_write() {
        bits |= libc::EPOLLOUT as u32;
    }
    if reg.wants_close() {
        bits |= libc::EPOLLRDHUP as u32;
    }
    bits
}

impl Backend for EpollBackend {
    fn register(&mut self, reg: &Registration) -> io::Result<()> {
        match reg.descriptor() {
            Some(fd) => self.ctl(libc::EPOLL_CTL_ADD, fd, Some(reg)),
            None => Ok(()),
        }
    }

    fn reregister(&mut self, reg: &Registration, previous: Option<RawFd>) -> io::Result<()> {
        match (previous, reg.descriptor()) {
            (Some(old), Some(new)) if old == new => self.ctl(libc::EPOLL_CTL_MOD, new, Some(reg)),
            (Some(old), new) => {
                self.ctl(libc::EPOLL_CTL_DEL, old, None)?;
                match new {
                    Some(fd) => self.ctl(libc::EPOLL_CTL_ADD, fd, Some(reg)),
                    None => Ok(()),
                }
            }
            (None, Some(fd)) => self.ctl(libc::EPOLL_CTL_ADD, fd, Some(reg)),
            (None, None) => Ok(()),
        }
    }

    fn poll(
        &mut self,
        _registrations: &[Registration],
        timeout_ms: i32,
        max_events: usize,
        ready: &mut Vec<Ready>,
    ) -> io::Result<()> {
        let max = max_events.min(self.events.len()).max(1);
        let rc = cvt(unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                max as libc::c_int,
                timeout_ms,
            )
        })?;

        for event in &self.events[..rc as usize] {
            let bits = event.events;
            let has = |flag: libc::c_int| bits & flag as u32 != 0;
            ready.push(Ready {
                position: event.u64 as usize,
                readable: has(libc::EPOLLIN),
                writable: has(libc::EPOLLOUT),
                read_closed: has(libc::EPOLLRDHUP),
                hangup: has(libc::EPOLLHUP),
                error: has(libc::EPOLLERR),
            });
        }
        Ok(())
    }
}
