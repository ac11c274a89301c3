//! Readiness multiplexer.
//!
//! An [`EventSet`] has a fixed capacity chosen at construction. Each
//! registration gets a position that stays valid for the lifetime of the set.
//! [`EventSet::wait`] blocks until at least one registration is ready, the
//! timeout expires, or the registered latch is set.
//!
//! The registration and result model (position, interest mask, user data) is
//! the same for every backend; only the syscall underneath differs.

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::latch::Latch;
use crate::Descriptor;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(unix)]
mod poll;
#[cfg(windows)]
mod windows;

/// Bit mask of the conditions a registration is interested in, and of the
/// conditions reported back by [`EventSet::wait`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u32);

impl Interest {
    pub const LATCH_SET: Interest = Interest(1 << 0);
    pub const SOCKET_READABLE: Interest = Interest(1 << 1);
    pub const SOCKET_WRITEABLE: Interest = Interest(1 << 2);
    /// The owner process (see [`OwnerSentinel`](crate::OwnerSentinel)) exited.
    pub const OWNER_DEATH: Interest = Interest(1 << 3);
    /// Like `OWNER_DEATH`, but the waiting process exits instead of reporting.
    pub const EXIT_ON_OWNER_DEATH: Interest = Interest(1 << 4);
    /// The peer shut down its sending side, or the connection failed.
    pub const SOCKET_CLOSED: Interest = Interest(1 << 5);
    /// A listening socket has a connection ready for `accept()`.
    pub const SOCKET_ACCEPT: Interest = Interest(1 << 6);

    pub const SOCKET_MASK: Interest = Interest(
        Self::SOCKET_READABLE.0
            | Self::SOCKET_WRITEABLE.0
            | Self::SOCKET_CLOSED.0
            | Self::SOCKET_ACCEPT.0,
    );
    pub const OWNER_MASK: Interest =
        Interest(Self::OWNER_DEATH.0 | Self::EXIT_ON_OWNER_DEATH.0);

    pub const fn empty() -> Self {
        Interest(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Interest, &str); 7] = [
            (Interest::LATCH_SET, "LATCH_SET"),
            (Interest::SOCKET_READABLE, "SOCKET_READABLE"),
            (Interest::SOCKET_WRITEABLE, "SOCKET_WRITEABLE"),
            (Interest::OWNER_DEATH, "OWNER_DEATH"),
            (Interest::EXIT_ON_OWNER_DEATH, "EXIT_ON_OWNER_DEATH"),
            (Interest::SOCKET_CLOSED, "SOCKET_CLOSED"),
            (Interest::SOCKET_ACCEPT, "SOCKET_ACCEPT"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("(empty)")
        } else {
            f.write_str(&names.join(" | "))
        }
    }
}

/// One reported readiness condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEvent {
    /// Position returned by [`EventSet::add_event`].
    pub position: usize,
    pub events: Interest,
    /// Descriptor of a socket registration; `None` for latch and owner events.
    pub fd: Option<Descriptor>,
    pub user_data: usize,
}

/// Host facility used to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Epoll,
    Kqueue,
    Poll,
    Windows,
}

impl BackendKind {
    /// The preferred facility for the build target.
    pub const fn native() -> BackendKind {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            BackendKind::Epoll
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd"
        )) {
            BackendKind::Kqueue
        } else if cfg!(windows) {
            BackendKind::Windows
        } else {
            BackendKind::Poll
        }
    }
}

#[derive(Clone)]
pub(crate) enum Source {
    Socket(Descriptor),
    /// `None` keeps the position reserved until a latch is attached with
    /// [`EventSet::modify_event`].
    Latch(Option<Arc<Latch>>),
    OwnerDeath(Descriptor),
}

#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) position: usize,
    pub(crate) interest: Interest,
    pub(crate) source: Source,
    pub(crate) user_data: usize,
}

impl Registration {
    /// The descriptor the backend actually watches, if any.
    #[cfg(unix)]
    pub(crate) fn descriptor(&self) -> Option<Descriptor> {
        match &self.source {
            Source::Socket(fd) | Source::OwnerDeath(fd) => Some(*fd),
            Source::Latch(Some(latch)) => Some(latch.wake_fd()),
            Source::Latch(None) => None,
        }
    }

    pub(crate) fn wants_read(&self) -> bool {
        match self.source {
            Source::Socket(_) => self.interest.intersects(
                Interest::SOCKET_READABLE | Interest::SOCKET_ACCEPT,
            ),
            Source::Latch(_) | Source::OwnerDeath(_) => true,
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        matches!(self.source, Source::Socket(_))
            && self.interest.contains(Interest::SOCKET_WRITEABLE)
    }

    pub(crate) fn wants_close(&self) -> bool {
        matches!(self.source, Source::Socket(_))
            && self.interest.contains(Interest::SOCKET_CLOSED)
    }
}

/// Raw readiness as reported by a backend, before it is matched against the
/// registration's interest.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Ready {
    pub(crate) position: usize,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) read_closed: bool,
    pub(crate) hangup: bool,
    pub(crate) error: bool,
}

pub(crate) trait Backend {
    fn register(&mut self, reg: &Registration) -> io::Result<()>;

    /// Re-arm a registration whose interest or source changed. `previous` is
    /// the descriptor that was being watched before the change.
    fn reregister(&mut self, reg: &Registration, previous: Option<Descriptor>) -> io::Result<()>;

    /// Block for at most `timeout_ms` (negative: forever) and append up to
    /// `max_events` entries to `ready`. Appending nothing means the timeout
    /// expired. An interrupted syscall is returned as `ErrorKind::Interrupted`.
    fn poll(
        &mut self,
        registrations: &[Registration],
        timeout_ms: i32,
        max_events: usize,
        ready: &mut Vec<Ready>,
    ) -> io::Result<()>;
}

enum BlockOutcome {
    TimedOut,
    Completed,
}

/// Fixed-capacity set of readiness interests.
pub struct EventSet {
    registrations: Vec<Registration>,
    capacity: usize,
    latch_position: Option<usize>,
    backend: Box<dyn Backend>,
    kind: BackendKind,
    ready: Vec<Ready>,
}

impl EventSet {
    /// Create a set backed by the platform's preferred facility.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Self::with_backend(BackendKind::native(), capacity)
    }

    /// Create a set on an explicit backend. `Poll` is available on every
    /// Unix target; requesting a backend the target lacks fails with
    /// `ErrorKind::Unsupported`.
    pub fn with_backend(kind: BackendKind, capacity: usize) -> io::Result<Self> {
        assert!(capacity > 0, "event set capacity must be positive");
        let backend = open_backend(kind, capacity)?;
        Ok(Self {
            registrations: Vec::with_capacity(capacity),
            capacity,
            latch_position: None,
            backend,
            kind,
            ready: Vec::with_capacity(capacity),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Register one interest and return its position.
    ///
    /// `interest` must name exactly one kind of source: `LATCH_SET` (with an
    /// optional `latch`), one of the owner-death flags (with the sentinel's
    /// descriptor in `fd`), or any combination of socket flags (with the
    /// socket in `fd`).
    ///
    /// # Panics
    /// On programming errors: the set is full, a second latch is registered,
    /// a socket or owner interest lacks a descriptor, the mask mixes source
    /// kinds, or the latch belongs to another process.
    pub fn add_event(
        &mut self,
        interest: Interest,
        fd: Option<Descriptor>,
        latch: Option<Arc<Latch>>,
        user_data: usize,
    ) -> io::Result<usize> {
        assert!(
            self.registrations.len() < self.capacity,
            "event set is full (capacity {})",
            self.capacity
        );

        let position = self.registrations.len();
        let source = classify(interest, fd, latch);
        if let Source::Latch(_) = source {
            assert!(
                self.latch_position.is_none(),
                "cannot register more than one latch in an event set"
            );
        }

        let registration = Registration {
            position,
            interest,
            source,
            user_data,
        };
        self.backend.register(&registration)?;

        if let Source::Latch(_) = registration.source {
            self.latch_position = Some(position);
        }
        trace!(position, ?interest, "registered event");
        self.registrations.push(registration);
        Ok(position)
    }

    /// Change the interest mask of a socket registration, or attach/detach
    /// the latch of a latch registration.
    ///
    /// # Panics
    /// If `position` is out of range, the new mask changes the kind of
    /// source, or an owner-death registration is modified.
    pub fn modify_event(
        &mut self,
        position: usize,
        interest: Interest,
        latch: Option<Arc<Latch>>,
    ) -> io::Result<()> {
        let current = self
            .registrations
            .get(position)
            .unwrap_or_else(|| panic!("no event registered at position {position}"))
            .clone();

        let updated_source = match &current.source {
            Source::Socket(fd) => {
                assert!(
                    !interest.is_empty() && Interest::SOCKET_MASK.contains(interest),
                    "socket registration can only be modified to socket interests"
                );
                if interest == current.interest {
                    return Ok(());
                }
                Source::Socket(*fd)
            }
            Source::Latch(existing) => {
                assert!(
                    interest == Interest::LATCH_SET,
                    "latch registration can only carry LATCH_SET"
                );
                if let Some(latch) = &latch {
                    assert!(
                        latch.is_owned_by_current_process(),
                        "cannot wait on a latch owned by another process"
                    );
                }
                let same = match (existing, &latch) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                };
                if same {
                    return Ok(());
                }
                Source::Latch(latch)
            }
            Source::OwnerDeath(_) => panic!("owner-death registrations cannot be modified"),
        };

        let updated = Registration {
            interest,
            source: updated_source,
            ..current.clone()
        };
        #[cfg(unix)]
        let previous = current.descriptor();
        #[cfg(windows)]
        let previous = match current.source {
            Source::Socket(fd) => Some(fd),
            _ => None,
        };
        self.backend.reregister(&updated, previous)?;
        self.registrations[position] = updated;
        Ok(())
    }

    /// Wait for readiness.
    ///
    /// `timeout` of `None` blocks until something happens, `Some(ZERO)` polls.
    /// At most `max_events` entries are written to `out` (which is cleared
    /// first). Returns the number of events; `0` means the timeout expired.
    ///
    /// If the registered latch is already set, returns immediately with a
    /// `LATCH_SET` event. Interrupted system calls are retried with the
    /// remaining timeout and never reported as a timeout on their own.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<WaitEvent>,
        max_events: usize,
    ) -> io::Result<usize> {
        assert!(max_events > 0, "max_events must be positive");
        out.clear();

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut cur_timeout_ms = timeout.map_or(-1, duration_to_ms);
        let latch = self.active_latch();

        while out.is_empty() {
            if let Some((position, user_data, latch)) = &latch {
                if !latch.is_set() {
                    latch.begin_sleep();
                }
                // A set() that raced with begin_sleep() is seen here, or it
                // found maybe_sleeping and wrote to the wake-up channel.
                if latch.is_set() {
                    out.push(WaitEvent {
                        position: *position,
                        events: Interest::LATCH_SET,
                        fd: None,
                        user_data: *user_data,
                    });
                    latch.end_sleep();
                    // Polling here would report the same latch again through
                    // its wake-up channel.
                    break;
                }
            }

            let outcome = self.wait_block(cur_timeout_ms, out, max_events);
            if let Some((_, _, latch)) = &latch {
                latch.end_sleep();
            }
            match outcome? {
                BlockOutcome::TimedOut => break,
                BlockOutcome::Completed => {}
            }

            if out.is_empty() {
                if let Some(deadline) = deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    cur_timeout_ms = duration_to_ms(remaining);
                }
            }
        }

        Ok(out.len())
    }

    fn active_latch(&self) -> Option<(usize, usize, Arc<Latch>)> {
        let position = self.latch_position?;
        let registration = &self.registrations[position];
        match &registration.source {
            Source::Latch(Some(latch)) => {
                Some((position, registration.user_data, Arc::clone(latch)))
            }
            _ => None,
        }
    }

    /// One call into the backend, translating raw readiness into events.
    fn wait_block(
        &mut self,
        timeout_ms: i32,
        out: &mut Vec<WaitEvent>,
        max_events: usize,
    ) -> io::Result<BlockOutcome> {
        self.ready.clear();
        let room = max_events - out.len();
        match self
            .backend
            .poll(&self.registrations, timeout_ms, room, &mut self.ready)
        {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                return Ok(BlockOutcome::Completed);
            }
            Err(err) => return Err(err),
        }
        if self.ready.is_empty() {
            return Ok(BlockOutcome::TimedOut);
        }

        for ready in &self.ready {
            if out.len() >= max_events {
                break;
            }
            let registration = &self.registrations[ready.position];
            if let Some(event) = translate(registration, ready) {
                out.push(event);
            }
        }
        Ok(BlockOutcome::Completed)
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSet")
            .field("backend", &self.kind)
            .field("len", &self.registrations.len())
            .field("capacity", &self.capacity)
            .field("latch_position", &self.latch_position)
            .finish()
    }
}

fn classify(interest: Interest, fd: Option<Descriptor>, latch: Option<Arc<Latch>>) -> Source {
    if interest == Interest::LATCH_SET {
        if let Some(latch) = &latch {
            assert!(
                latch.is_owned_by_current_process(),
                "cannot wait on a latch owned by another process"
            );
        }
        return Source::Latch(latch);
    }
    assert!(
        latch.is_none(),
        "a latch can only be registered with LATCH_SET alone"
    );

    if interest.intersects(Interest::OWNER_MASK) {
        assert!(
            Interest::OWNER_MASK.contains(interest),
            "owner-death interest cannot be combined with other interests"
        );
        let fd = fd.expect("owner-death interest requires the sentinel descriptor");
        return Source::OwnerDeath(fd);
    }

    assert!(
        !interest.is_empty() && Interest::SOCKET_MASK.contains(interest),
        "unsupported interest mask {interest:?}"
    );
    let fd = fd.unwrap_or_else(|| panic!("{interest:?} requires a socket descriptor"));
    Source::Socket(fd)
}

fn translate(registration: &Registration, ready: &Ready) -> Option<WaitEvent> {
    let (events, fd) = match &registration.source {
        Source::Latch(Some(latch)) => {
            latch.drain();
            if !latch.is_set() {
                // Spurious: the wake-up belonged to a latch that has since
                // been reset.
                return None;
            }
            (Interest::LATCH_SET, None)
        }
        Source::Latch(None) => return None,
        Source::OwnerDeath(fd) => {
            if !(ready.readable || ready.hangup || ready.error) || owner_alive(*fd) {
                return None;
            }
            if registration.interest.contains(Interest::EXIT_ON_OWNER_DEATH) {
                std::process::exit(1);
            }
            (Interest::OWNER_DEATH, None)
        }
        Source::Socket(fd) => {
            let wanted = registration.interest;
            let broken = ready.hangup || ready.error;
            let mut events = Interest::empty();
            if (ready.readable || broken) && wanted.contains(Interest::SOCKET_READABLE) {
                events |= Interest::SOCKET_READABLE;
            }
            if (ready.readable || broken) && wanted.contains(Interest::SOCKET_ACCEPT) {
                events |= Interest::SOCKET_ACCEPT;
            }
            if (ready.writable || broken) && wanted.contains(Interest::SOCKET_WRITEABLE) {
                events |= Interest::SOCKET_WRITEABLE;
            }
            if (ready.read_closed || broken) && wanted.contains(Interest::SOCKET_CLOSED) {
                events |= Interest::SOCKET_CLOSED;
            }
            if events.is_empty() {
                return None;
            }
            (events, Some(*fd))
        }
    };

    Some(WaitEvent {
        position: registration.position,
        events,
        fd,
        user_data: registration.user_data,
    })
}

#[cfg(unix)]
fn owner_alive(fd: Descriptor) -> bool {
    crate::sentinel::owner_alive(fd)
}

#[cfg(windows)]
fn owner_alive(_fd: Descriptor) -> bool {
    true
}

fn duration_to_ms(timeout: Duration) -> i32 {
    // Round up so a sub-millisecond remainder still blocks instead of spinning.
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    i32::try_from(millis).unwrap_or(i32::MAX)
}

fn open_backend(kind: BackendKind, capacity: usize) -> io::Result<Box<dyn Backend>> {
    match kind {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        BackendKind::Epoll => Ok(Box::new(epoll::EpollBackend::new(capacity)?)),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd"
        ))]
        BackendKind::Kqueue => Ok(Box::new(kqueue::KqueueBackend::new(capacity)?)),
        #[cfg(unix)]
        BackendKind::Poll => Ok(Box::new(poll::PollBackend::new(capacity))),
        #[cfg(windows)]
        BackendKind::Windows => Ok(Box::new(windows::WindowsBackend::new(capacity)?)),
        #[allow(unreachable_patterns)]
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{other:?} readiness backend is not available on this platform"),
        )),
    }
}
