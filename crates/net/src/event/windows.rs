use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{HANDLE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::Networking::WinSock::{
    WSACloseEvent, WSACreateEvent, WSAEnumNetworkEvents, WSAEventSelect, WSAGetLastError,
    FD_ACCEPT, FD_CLOSE, FD_READ, FD_WRITE, SOCKET, SOCKET_ERROR, WSANETWORKEVENTS,
};
use windows_sys::Win32::System::Threading::{WaitForMultipleObjects, WaitForSingleObject, INFINITE};

use super::{Backend, Ready, Registration, Source};
use crate::Descriptor;

/// One event object per socket registration; the latch contributes its own
/// manual-reset event.
pub(crate) struct WindowsBackend {
    socket_events: Vec<Option<HANDLE>>,
    /// Positions whose write interest was (re)armed since the last wait.
    /// FD_WRITE only fires after a send would have blocked, so a freshly
    /// armed socket is reported writeable once without waiting.
    write_armed: Vec<bool>,
    handles: Vec<HANDLE>,
    positions: Vec<usize>,
}

impl WindowsBackend {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            socket_events: Vec::with_capacity(capacity),
            write_armed: Vec::with_capacity(capacity),
            handles: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
        })
    }

    fn select(&mut self, reg: &Registration) -> io::Result<()> {
        let Source::Socket(socket) = reg.source else {
            return Ok(());
        };
        let event = match self.socket_events[reg.position] {
            Some(event) => event,
            None => {
                let event = unsafe { WSACreateEvent() };
                if event.is_null() {
                    return Err(wsa_error());
                }
                self.socket_events[reg.position] = Some(event);
                event
            }
        };
        let mut mask = FD_CLOSE as i32;
        if reg.wants_read() {
            mask |= (FD_READ | FD_ACCEPT) as i32;
        }
        if reg.wants_write() {
            mask |= FD_WRITE as i32;
        }
        if unsafe { WSAEventSelect(socket as SOCKET, event, mask) } == SOCKET_ERROR {
            return Err(wsa_error());
        }
        self.write_armed[reg.position] = reg.wants_write();
        Ok(())
    }

    fn socket_ready(&self, position: usize, socket: Descriptor) -> io::Result<Ready> {
        let mut network: WSANETWORKEVENTS = unsafe { std::mem::zeroed() };
        let event = self.socket_events[position].unwrap_or(ptr::null_mut());
        if unsafe { WSAEnumNetworkEvents(socket as SOCKET, event, &mut network) } == SOCKET_ERROR {
            return Err(wsa_error());
        }
        let bits = network.lNetworkEvents;
        let has = |flag: u32| bits & flag as i32 != 0;
        Ok(Ready {
            position,
            readable: has(FD_READ) || has(FD_ACCEPT),
            writable: has(FD_WRITE),
            read_closed: has(FD_CLOSE),
            hangup: false,
            error: false,
        })
    }
}

impl Drop for WindowsBackend {
    fn drop(&mut self) {
        for event in self.socket_events.iter().flatten() {
            unsafe {
                WSACloseEvent(*event);
            }
        }
    }
}

fn wsa_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

impl Backend for WindowsBackend {
    fn register(&mut self, reg: &Registration) -> io::Result<()> {
        if let Source::OwnerDeath(_) = reg.source {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "owner-death detection is not available on Windows",
            ));
        }
        self.socket_events.push(None);
        self.write_armed.push(false);
        self.select(reg)
    }

    fn reregister(&mut self, reg: &Registration, _previous: Option<Descriptor>) -> io::Result<()> {
        self.select(reg)
    }

    fn poll(
        &mut self,
        registrations: &[Registration],
        timeout_ms: i32,
        max_events: usize,
        ready: &mut Vec<Ready>,
    ) -> io::Result<()> {
        for reg in registrations {
            if ready.len() >= max_events {
                return Ok(());
            }
            if std::mem::take(&mut self.write_armed[reg.position]) {
                ready.push(Ready {
                    position: reg.position,
                    writable: true,
                    ..Ready::default()
                });
            }
        }
        if !ready.is_empty() {
            return Ok(());
        }

        self.handles.clear();
        self.positions.clear();
        for reg in registrations {
            let handle = match &reg.source {
                Source::Latch(Some(latch)) => latch.wake_handle(),
                Source::Socket(_) => match self.socket_events[reg.position] {
                    Some(event) => event,
                    None => continue,
                },
                _ => continue,
            };
            self.handles.push(handle);
            self.positions.push(reg.position);
        }
        if self.handles.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms.max(0) as u64));
            return Ok(());
        }

        let wait_ms = if timeout_ms < 0 { INFINITE } else { timeout_ms as u32 };
        let rc = unsafe {
            WaitForMultipleObjects(self.handles.len() as u32, self.handles.as_ptr(), 0, wait_ms)
        };
        if rc == WAIT_TIMEOUT {
            return Ok(());
        }
        if rc == WAIT_FAILED {
            return Err(io::Error::last_os_error());
        }
        let first = (rc - WAIT_OBJECT_0) as usize;

        // WaitForMultipleObjects reports only the lowest signalled index;
        // probe the rest without blocking.
        for index in first..self.handles.len() {
            if ready.len() >= max_events {
                break;
            }
            if index != first && unsafe { WaitForSingleObject(self.handles[index], 0) } != WAIT_OBJECT_0 {
                continue;
            }
            let position = self.positions[index];
            match registrations[position].source {
                Source::Socket(socket) => {
                    let entry = self.socket_ready(position, socket)?;
                    if entry.readable || entry.writable || entry.read_closed {
                        ready.push(entry);
                    }
                }
                _ => ready.push(Ready {
                    position,
                    readable: true,
                    ..Ready::default()
                }),
            }
        }
        // Nothing survived the network-event check: let the caller retry
        // with the remaining timeout instead of reporting a timeout.
        if ready.is_empty() {
            return Err(io::ErrorKind::Interrupted.into());
        }
        Ok(())
    }
}
