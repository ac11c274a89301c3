//! Listening sockets.
//!
//! [`listen`] turns a list of configured addresses into bound, listening,
//! non-blocking sockets. One bad address never stops the others; the call
//! only fails when nothing could be bound at all.

use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::unistd::{chown, Gid, Group};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sys::{cvt, set_cloexec, set_nonblocking};

/// Upper bound on the number of sockets a single call opens.
pub const MAX_LISTEN_SOCKETS: usize = 64;

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("no listen addresses configured")]
    NoAddresses,
    #[error("could not create any listening socket ({attempted} address(es) tried)")]
    NoneBound { attempted: usize },
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
}

/// One configured listen address, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// `*`: every IPv4 and IPv6 interface.
    AllInterfaces,
    /// Hostname or IP literal, resolved at listen time.
    Host(String),
    /// `unix:<path>`
    Unix(PathBuf),
}

impl FromStr for ListenAddress {
    type Err = ListenError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed == "*" {
            return Ok(ListenAddress::AllInterfaces);
        }
        if let Some(path) = trimmed.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ListenError::InvalidAddress(raw.to_string()));
            }
            return Ok(ListenAddress::Unix(PathBuf::from(path)));
        }
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return Err(ListenError::InvalidAddress(raw.to_string()));
        }
        Ok(ListenAddress::Host(trimmed.to_string()))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::AllInterfaces => f.write_str("*"),
            ListenAddress::Host(host) => f.write_str(host),
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Unix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl BoundAddress {
    pub fn family(&self) -> AddressFamily {
        match self {
            BoundAddress::Inet(SocketAddr::V4(_)) => AddressFamily::Inet,
            BoundAddress::Inet(SocketAddr::V6(_)) => AddressFamily::Inet6,
            BoundAddress::Unix(_) => AddressFamily::Unix,
        }
    }
}

impl fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddress::Inet(addr) => write!(f, "{addr}"),
            BoundAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub port: u16,
    /// Backlog passed to `listen(2)` is twice this value.
    pub max_connections: u32,
    /// Mode applied to Unix socket files before they start accepting.
    pub unix_socket_permissions: u32,
    /// Group name or numeric gid for Unix socket files.
    pub unix_socket_group: Option<String>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            port: 8670,
            max_connections: 100,
            unix_socket_permissions: 0o770,
            unix_socket_group: None,
        }
    }
}

impl ListenOptions {
    fn backlog(&self) -> libc::c_int {
        self.max_connections
            .saturating_mul(2)
            .min(libc::c_int::MAX as u32) as libc::c_int
    }
}

#[derive(Debug)]
pub struct ListeningSocket {
    fd: OwnedFd,
    address: BoundAddress,
}

impl ListeningSocket {
    pub fn family(&self) -> AddressFamily {
        self.address.family()
    }

    pub fn address(&self) -> &BoundAddress {
        &self.address
    }

    /// Accept one pending connection. `Ok(None)` means nothing was pending.
    ///
    /// The returned stream is close-on-exec and left in whatever blocking
    /// mode the caller sets; TCP streams get `TCP_NODELAY` and `SO_KEEPALIVE`.
    pub fn accept(&self) -> io::Result<Option<Accepted>> {
        let fd = loop {
            let rc = unsafe {
                libc::accept(self.fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
            };
            if rc >= 0 {
                break rc;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        };
        // SAFETY: accept(2) returned a new descriptor that nothing else owns.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        set_cloexec(owned.as_raw_fd())?;

        let accepted = match &self.address {
            BoundAddress::Inet(local) => {
                let stream = TcpStream::from(owned);
                set_bool_option(stream.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
                set_bool_option(stream.as_raw_fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE)?;
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "[unknown]".to_string());
                Accepted {
                    stream: AcceptedStream::Tcp(stream),
                    local: local.to_string(),
                    peer,
                }
            }
            BoundAddress::Unix(path) => Accepted {
                stream: AcceptedStream::Unix(UnixStream::from(owned)),
                local: format!("unix:{}", path.display()),
                peer: "[local]".to_string(),
            },
        };
        Ok(Some(accepted))
    }

    /// Unlink the socket file of a Unix listener. Only the process that
    /// created it should call this, at shutdown.
    pub fn remove_socket_file(&self) {
        if let BoundAddress::Unix(path) = &self.address {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed socket file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), %err, "could not remove socket file"),
            }
        }
    }
}

impl AsRawFd for ListeningSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A freshly accepted connection plus printable endpoint labels.
#[derive(Debug)]
pub struct Accepted {
    pub stream: AcceptedStream,
    pub local: String,
    pub peer: String,
}

#[derive(Debug)]
pub enum AcceptedStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AcceptedStream {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            AcceptedStream::Tcp(stream) => stream.set_nonblocking(nonblocking),
            AcceptedStream::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }
}

impl AsRawFd for AcceptedStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            AcceptedStream::Tcp(stream) => stream.as_raw_fd(),
            AcceptedStream::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Inet(SocketAddr),
    Unix(PathBuf),
}

/// Open one listening socket per resolved address.
///
/// Duplicates after resolution are bound once. Failures for individual
/// addresses are logged and skipped.
pub fn listen(
    addresses: &[ListenAddress],
    options: &ListenOptions,
) -> Result<Vec<ListeningSocket>, ListenError> {
    if addresses.is_empty() {
        return Err(ListenError::NoAddresses);
    }

    let targets = resolve(addresses, options.port);
    let mut sockets = Vec::new();
    for target in &targets {
        if sockets.len() >= MAX_LISTEN_SOCKETS {
            warn!(
                limit = MAX_LISTEN_SOCKETS,
                "too many listen addresses; ignoring the rest"
            );
            break;
        }
        let opened = match target {
            Target::Inet(addr) => open_inet(*addr, options),
            Target::Unix(path) => open_unix(path, options),
        };
        match opened {
            Ok(socket) => {
                info!(address = %socket.address, "listening");
                sockets.push(socket);
            }
            Err(err) => warn!(target = ?target, %err, "could not create listening socket"),
        }
    }

    if sockets.is_empty() {
        return Err(ListenError::NoneBound {
            attempted: targets.len().max(addresses.len()),
        });
    }
    Ok(sockets)
}

fn resolve(addresses: &[ListenAddress], port: u16) -> Vec<Target> {
    let mut targets: Vec<Target> = Vec::new();
    let mut push = |target: Target| {
        if !targets.contains(&target) {
            targets.push(target);
        }
    };

    for address in addresses {
        match address {
            ListenAddress::AllInterfaces => {
                push(Target::Inet(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)));
                push(Target::Inet(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)));
            }
            ListenAddress::Host(host) => match (host.as_str(), port).to_socket_addrs() {
                Ok(resolved) => resolved.for_each(|addr| push(Target::Inet(addr))),
                Err(err) => warn!(host = %host, %err, "could not resolve listen address"),
            },
            ListenAddress::Unix(path) => push(Target::Unix(path.clone())),
        }
    }
    targets
}

fn new_socket(domain: libc::c_int) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) })?;
    // SAFETY: socket(2) returned a fresh descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(fd.as_raw_fd())?;
    Ok(fd)
}

fn set_bool_option(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let one: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

fn finish_listen(fd: OwnedFd, address: BoundAddress, options: &ListenOptions) -> io::Result<ListeningSocket> {
    cvt(unsafe { libc::listen(fd.as_raw_fd(), options.backlog()) })?;
    set_nonblocking(fd.as_raw_fd(), true)?;
    Ok(ListeningSocket { fd, address })
}

fn open_inet(addr: SocketAddr, options: &ListenOptions) -> io::Result<ListeningSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = new_socket(domain)?;
    set_bool_option(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
    if addr.is_ipv6() {
        // Keep v4 and v6 wildcards from colliding on dual-stack hosts.
        set_bool_option(fd.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_V6ONLY)?;
    }

    let (storage, len) = inet_sockaddr(&addr);
    cvt(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    })?;

    // Port 0 asks the kernel to choose; report what it picked.
    let bound = if addr.port() == 0 {
        local_inet_addr(fd.as_raw_fd()).unwrap_or(addr)
    } else {
        addr
    };
    finish_listen(fd, BoundAddress::Inet(bound), options)
}

fn open_unix(path: &Path, options: &ListenOptions) -> io::Result<ListeningSocket> {
    remove_stale_socket(path)?;

    let fd = new_socket(libc::AF_UNIX)?;
    let (addr, len) = unix_sockaddr(path)?;
    cvt(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    })?;

    // Fix up ownership and mode before listen(2) so no connection can be
    // accepted under the process umask.
    unlink_on_error(path, secure_socket_file(path, options))?;
    unlink_on_error(
        path,
        finish_listen(fd, BoundAddress::Unix(path.to_path_buf()), options),
    )
}

/// Remove the socket file bound at `path` if a later setup step failed.
fn unlink_on_error<T>(path: &Path, result: io::Result<T>) -> io::Result<T> {
    if result.is_err() {
        let _ = std::fs::remove_file(path);
    }
    result
}

/// Clear a socket file left behind by a server that is gone. A socket
/// somebody still accepts on is left alone.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            if UnixStream::connect(path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is in use by a running server", path.display()),
                ));
            }
            debug!(path = %path.display(), "removing stale socket file");
            std::fs::remove_file(path)
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn secure_socket_file(path: &Path, options: &ListenOptions) -> io::Result<()> {
    if let Some(group) = options.unix_socket_group.as_deref() {
        let gid = resolve_group(group)?;
        chown(path, None, Some(gid)).map_err(io::Error::from)?;
    }
    std::fs::set_permissions(
        path,
        std::fs::Permissions::from_mode(options.unix_socket_permissions),
    )
}

fn resolve_group(group: &str) -> io::Result<Gid> {
    if let Ok(raw) = group.parse::<u32>() {
        return Ok(Gid::from_raw(raw));
    }
    match Group::from_name(group) {
        Ok(Some(entry)) => Ok(entry.gid),
        Ok(None) => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("group \"{group}\" does not exist"),
        )),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

fn inet_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid bit pattern for sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly", target_os = "openbsd", target_os = "netbsd"))]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly", target_os = "openbsd", target_os = "netbsd"))]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn local_inet_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return None;
    }
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

fn unix_sockaddr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: all-zero is a valid bit pattern for sockaddr_un.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Leave room for the terminating NUL.
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Unix socket path \"{}\" is too long (maximum {} bytes)",
                path.display(),
                addr.sun_path.len() - 1
            ),
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let base = mem::size_of::<libc::sockaddr_un>() - addr.sun_path.len();
    Ok((addr, (base + bytes.len() + 1) as libc::socklen_t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_forms() {
        assert_eq!("*".parse::<ListenAddress>().unwrap(), ListenAddress::AllInterfaces);
        assert_eq!(
            " localhost ".parse::<ListenAddress>().unwrap(),
            ListenAddress::Host("localhost".into())
        );
        assert_eq!(
            "unix:/run/hagent.sock".parse::<ListenAddress>().unwrap(),
            ListenAddress::Unix(PathBuf::from("/run/hagent.sock"))
        );
        assert!("unix:".parse::<ListenAddress>().is_err());
        assert!("".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn wildcard_expands_to_both_families_once() {
        let targets = resolve(
            &[ListenAddress::AllInterfaces, ListenAddress::AllInterfaces],
            9000,
        );
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&Target::Inet("0.0.0.0:9000".parse().unwrap())));
        assert!(targets.contains(&Target::Inet("[::]:9000".parse().unwrap())));
    }

    #[test]
    fn backlog_is_twice_max_connections() {
        let options = ListenOptions {
            max_connections: 7,
            ..ListenOptions::default()
        };
        assert_eq!(options.backlog(), 14);
        let huge = ListenOptions {
            max_connections: u32::MAX,
            ..ListenOptions::default()
        };
        assert_eq!(huge.backlog(), libc::c_int::MAX);
    }

    #[test]
    fn overlong_unix_path_is_rejected() {
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(200)));
        match unix_sockaddr(&long) {
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            Ok(_) => panic!("overlong path accepted"),
        }
    }

    #[test]
    fn failed_setup_unlinks_the_bound_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("half-open.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).expect("bind"));

        let kept = unlink_on_error(&path, Ok(()));
        assert!(kept.is_ok());
        assert!(path.exists());

        let failed: io::Result<()> = unlink_on_error(&path, Err(io::ErrorKind::Other.into()));
        assert!(failed.is_err());
        assert!(!path.exists());
    }
}
