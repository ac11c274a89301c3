#![cfg(unix)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use hagent_net::{
    listen, AcceptedStream, AddressFamily, BoundAddress, ListenAddress, ListenError,
    ListenOptions,
};

fn options() -> ListenOptions {
    ListenOptions {
        port: 0,
        ..ListenOptions::default()
    }
}

fn accept_with_retry(socket: &hagent_net::ListeningSocket) -> hagent_net::Accepted {
    for _ in 0..100 {
        if let Some(accepted) = socket.accept().expect("accept") {
            return accepted;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("no connection arrived on {}", socket.address());
}

#[test]
fn unresolvable_entries_are_skipped_when_one_binds() {
    let addresses = vec![
        ListenAddress::Host("no-such-host.invalid".into()),
        ListenAddress::Host("127.0.0.1".into()),
    ];
    let sockets = listen(&addresses, &options()).expect("listen");
    assert_eq!(sockets.len(), 1);
    assert_eq!(sockets[0].family(), AddressFamily::Inet);
    match sockets[0].address() {
        BoundAddress::Inet(addr) => assert_ne!(addr.port(), 0),
        other => panic!("unexpected address {other}"),
    }
}

#[test]
fn fails_only_when_nothing_binds() {
    let err = listen(
        &[ListenAddress::Host("no-such-host.invalid".into())],
        &options(),
    )
    .expect_err("nothing should bind");
    assert!(matches!(err, ListenError::NoneBound { .. }), "{err}");

    let err = listen(&[], &options()).expect_err("empty list");
    assert!(matches!(err, ListenError::NoAddresses));
}

#[test]
fn duplicate_addresses_bind_once() {
    let addresses = vec![
        ListenAddress::Host("127.0.0.1".into()),
        ListenAddress::Host("127.0.0.1".into()),
    ];
    let sockets = listen(
        &addresses,
        &ListenOptions {
            // A fixed port is needed for the duplicate to be recognised.
            port: free_port(),
            ..ListenOptions::default()
        },
    )
    .expect("listen");
    assert_eq!(sockets.len(), 1);
}

fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
    probe.local_addr().expect("probe addr").port()
}

#[test]
fn tcp_listener_is_nonblocking_and_accepts() {
    let sockets = listen(&[ListenAddress::Host("127.0.0.1".into())], &options()).expect("listen");
    let socket = &sockets[0];
    assert!(socket.accept().expect("accept on idle socket").is_none());

    let BoundAddress::Inet(addr) = socket.address().clone() else {
        panic!("expected an inet listener");
    };
    let mut client = TcpStream::connect(addr).expect("connect");
    let accepted = accept_with_retry(socket);
    assert_eq!(accepted.local, addr.to_string());
    assert_eq!(accepted.peer, client.local_addr().expect("client addr").to_string());

    let AcceptedStream::Tcp(mut server) = accepted.stream else {
        panic!("expected a tcp stream");
    };
    assert!(server.nodelay().expect("nodelay"));
    server.set_nonblocking(false).expect("blocking");
    client.write_all(b"ping").expect("write");
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"ping");
}

#[test]
fn unix_socket_gets_mode_and_replaces_stale_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.sock");

    // Leave a stale socket file behind, as a crashed daemon would.
    drop(std::os::unix::net::UnixListener::bind(&path).expect("stale bind"));
    assert!(path.exists());

    let sockets = listen(
        &[ListenAddress::Unix(path.clone())],
        &ListenOptions {
            unix_socket_permissions: 0o700,
            ..options()
        },
    )
    .expect("listen");
    assert_eq!(sockets[0].family(), AddressFamily::Unix);

    let meta = std::fs::metadata(&path).expect("socket metadata");
    assert!(meta.file_type().is_socket());
    assert_eq!(meta.permissions().mode() & 0o777, 0o700);

    let _client = UnixStream::connect(&path).expect("connect");
    let accepted = accept_with_retry(&sockets[0]);
    assert_eq!(accepted.peer, "[local]");
    assert!(matches!(accepted.stream, AcceptedStream::Unix(_)));

    sockets[0].remove_socket_file();
    assert!(!path.exists());
}

#[test]
fn regular_file_in_the_way_is_not_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("not-a-socket");
    std::fs::write(&path, b"keep me").expect("write file");

    let err = listen(&[ListenAddress::Unix(path.clone())], &options()).expect_err("must fail");
    assert!(matches!(err, ListenError::NoneBound { attempted: 1 }));
    assert_eq!(std::fs::read(&path).expect("file survives"), b"keep me");
}

#[test]
fn socket_of_a_running_server_is_not_taken_over() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("busy.sock");
    let running = std::os::unix::net::UnixListener::bind(&path).expect("first bind");

    let err = listen(&[ListenAddress::Unix(path.clone())], &options()).expect_err("must fail");
    assert!(matches!(err, ListenError::NoneBound { attempted: 1 }));
    assert!(path.exists());

    // The earlier server still owns the path.
    running.set_nonblocking(true).expect("nonblocking");
    let _client = UnixStream::connect(&path).expect("connect");
    let mut accepted = None;
    for _ in 0..100 {
        if let Ok((stream, _)) = running.accept() {
            accepted = Some(stream);
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(accepted.is_some(), "original listener lost its socket");
}

#[test]
fn dropping_a_listener_leaves_the_socket_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("kept.sock");
    let sockets = listen(&[ListenAddress::Unix(path.clone())], &options()).expect("listen");
    drop(sockets);
    assert!(path.exists());
}
