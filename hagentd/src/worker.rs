//! Body of a forked per-connection worker.

use hagent_net::{Accepted, AcceptedStream};
use hagent_wire::{Connection, ErrorKind, Stream, TransportError};
use tracing::{debug, error, info};

use crate::command::{CloseReason, CommandProtocol};
use crate::components::Services;

/// Serve one client to completion and return the process exit status.
pub fn serve(accepted: Accepted, services: &Services, max_parameter_length: usize) -> i32 {
    let Accepted {
        stream,
        local,
        peer,
    } = accepted;
    match stream {
        AcceptedStream::Tcp(stream) => {
            serve_stream(stream, local, peer, services, max_parameter_length)
        }
        AcceptedStream::Unix(stream) => {
            serve_stream(stream, local, peer, services, max_parameter_length)
        }
    }
}

fn serve_stream<S: Stream>(
    stream: S,
    local: String,
    peer: String,
    services: &Services,
    max_parameter_length: usize,
) -> i32 {
    // The dispatcher's copy may have been non-blocking; the worker blocks.
    if let Err(err) = stream.set_nonblocking(false) {
        error!(%peer, "could not switch connection to blocking mode: {}", err);
        return 1;
    }

    let mut conn = Connection::new(stream, local, peer);
    let pid = std::process::id();
    debug!(pid, remote = %conn.remote_label(), local = %conn.local_label(), "worker started");

    if let Err(err) = conn.negotiate((services.channel)()) {
        error!(remote = %conn.remote_label(), "secure channel handshake failed: {}", err);
        return 1;
    }

    let mut protocol = CommandProtocol::new(&mut conn, services, max_parameter_length);
    let outcome = protocol.run();
    let handled = protocol.handled();
    exit_status(outcome, handled, conn.remote_label())
}

fn exit_status(outcome: Result<CloseReason, TransportError>, handled: u64, remote: &str) -> i32 {
    match outcome {
        Ok(CloseReason::Finished) => {
            info!(%remote, commands = handled, "session finished");
            0
        }
        Ok(CloseReason::PeerClosed) => {
            debug!(%remote, commands = handled, "client disconnected");
            0
        }
        Err(err) => match err.kind() {
            ErrorKind::PeerTerminated | ErrorKind::Transient => {
                debug!(%remote, commands = handled, "connection ended: {}", err);
                0
            }
            ErrorKind::ProtocolViolation | ErrorKind::Io => {
                error!(%remote, commands = handled, "FATAL: {}", err);
                1
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn exit_status_follows_error_class() {
        assert_eq!(exit_status(Ok(CloseReason::Finished), 3, "peer"), 0);
        assert_eq!(exit_status(Ok(CloseReason::PeerClosed), 0, "peer"), 0);
        assert_eq!(exit_status(Err(TransportError::UnexpectedEof), 1, "peer"), 0);
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(exit_status(Err(TransportError::Io(reset)), 1, "peer"), 0);
        assert_eq!(exit_status(Err(TransportError::InvalidLength(2)), 1, "peer"), 1);
        assert_eq!(exit_status(Err(TransportError::ProtocolSync), 1, "peer"), 1);
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(exit_status(Err(TransportError::Io(denied)), 1, "peer"), 1);
    }
}
