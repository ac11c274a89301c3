//! Parent-liveness detection for forked processes.
//!
//! The owner creates an [`OwnerSentinel`] before forking and keeps the write
//! end of a pipe open. Children call [`OwnerSentinel::release_owner_end`] and
//! register [`OwnerSentinel::watch_fd`] under `OWNER_DEATH` or
//! `EXIT_ON_OWNER_DEATH`. Nobody ever writes to the pipe: once every copy of
//! the write end is gone, which happens when the owner exits, the read end
//! reports end-of-file.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use crate::sys;

#[derive(Debug)]
pub struct OwnerSentinel {
    read: OwnedFd,
    write: Option<OwnedFd>,
    owner_pid: u32,
}

impl OwnerSentinel {
    pub fn new() -> io::Result<Self> {
        let (read, write) = sys::nonblocking_pipe()?;
        Ok(Self {
            read,
            write: Some(write),
            owner_pid: std::process::id(),
        })
    }

    /// Descriptor to register with an [`EventSet`](crate::EventSet).
    pub fn watch_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Close this process's copy of the owner's end. A child must do this
    /// right after fork, otherwise it keeps the pipe alive itself.
    pub fn release_owner_end(&mut self) {
        self.write = None;
    }

    /// Non-blocking check. Always true in the owner itself.
    pub fn owner_alive(&self) -> bool {
        if self.write.is_some() {
            return true;
        }
        owner_alive(self.watch_fd())
    }
}

pub(crate) fn owner_alive(fd: RawFd) -> bool {
    sys::drain_pipe(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_is_alive_while_write_end_is_held() {
        let mut sentinel = OwnerSentinel::new().expect("sentinel");
        assert!(sentinel.owner_alive());
        assert_eq!(sentinel.owner_pid(), std::process::id());

        // Simulates the owner exiting: the only write end goes away.
        sentinel.release_owner_end();
        assert!(!sentinel.owner_alive());
    }
}
