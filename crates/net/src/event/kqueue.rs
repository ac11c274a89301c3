use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use super::{Backend, Ready, Registration};
use crate::sys::{cvt, set_cloexec};

pub(crate) struct KqueueBackend {
    kq: OwnedFd,
    events: Vec<libc::kevent>,
}

fn change(fd: RawFd, filter: i16, flags: u16, position: usize) -> libc::kevent {
    // Zeroed first: some targets carry extra fields (FreeBSD's `ext`).
    let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
    kev.ident = fd as libc::uintptr_t;
    kev.filter = filter;
    kev.flags = flags;
    kev.udata = position as *mut libc::c_void;
    kev
}

impl KqueueBackend {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let fd = cvt(unsafe { libc::kqueue() })?;
        // SAFETY: kqueue() returned a fresh descriptor.
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        set_cloexec(kq.as_raw_fd())?;
        Ok(Self {
            kq,
            events: vec![unsafe { std::mem::zeroed() }; capacity],
        })
    }

    fn apply(&self, kev: &libc::kevent) -> io::Result<()> {
        cvt(unsafe { libc::kevent(self.kq.as_raw_fd(), kev, 1, ptr::null_mut(), 0, ptr::null()) })?;
        Ok(())
    }

    fn add(&self, reg: &Registration) -> io::Result<()> {
        let Some(fd) = reg.descriptor() else {
            return Ok(());
        };
        // Closed-peer detection rides on the read filter's EV_EOF.
        if reg.wants_read() || reg.wants_close() {
            self.apply(&change(fd, libc::EVFILT_READ, libc::EV_ADD, reg.position))?;
        }
        if reg.wants_write() {
            self.apply(&change(fd, libc::EVFILT_WRITE, libc::EV_ADD, reg.position))?;
        }
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            match self.apply(&change(fd, filter, libc::EV_DELETE, 0)) {
                Ok(()) => {}
                // The filter was never added for this descriptor.
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl Backend for KqueueBackend {
    fn register(&mut self, reg: &Registration) -> io::Result<()> {
        self.add(reg)
    }

    fn reregister(&mut self, reg: &Registration, previous: Option<RawFd>) -> io::Result<()> {
        if let Some(old) = previous {
            self.remove(old)?;
        }
        self.add(reg)
    }

    fn poll(
        &mut self,
        _registrations: &[Registration],
        timeout_ms: i32,
        max_events: usize,
        ready: &mut Vec<Ready>,
    ) -> io::Result<()> {
        let timeout = libc::timespec {
            tv_sec: (timeout_ms.max(0) / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms.max(0) % 1000) * 1_000_000) as libc::c_long,
        };
        let timeout_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            &timeout as *const libc::timespec
        };
        let max = max_events.min(self.events.len()).max(1);
        let rc = cvt(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                max as libc::c_int,
                timeout_ptr,
            )
        })?;

        for kev in &self.events[..rc as usize] {
            let eof = kev.flags & libc::EV_EOF != 0;
            let mut entry = Ready {
                position: kev.udata as usize,
                error: kev.flags & libc::EV_ERROR != 0,
                ..Ready::default()
            };
            if kev.filter == libc::EVFILT_READ {
                entry.readable = true;
                entry.read_closed = eof;
            } else if kev.filter == libc::EVFILT_WRITE {
                entry.writable = true;
                entry.hangup = eof;
            }
            // Read and write filters for one descriptor arrive separately.
            match ready.last_mut() {
                Some(prev) if prev.position == entry.position => {
                    prev.readable |= entry.readable;
                    prev.writable |= entry.writable;
                    prev.read_closed |= entry.read_closed;
                    prev.hangup |= entry.hangup;
                    prev.error |= entry.error;
                }
                _ => ready.push(entry),
            }
        }
        Ok(())
    }
}
