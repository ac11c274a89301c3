//! Client library for the cluster agent daemon.
//!
//! [`AgentClient`] speaks the command protocol over a blocking TCP or Unix
//! socket. Every request except [`AgentClient::finish`] returns the daemon's
//! status text.

use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use hagent_wire::protocol::{join_body, Action, Component, LifecycleAction, RESPONSE_MESSAGE};
use hagent_wire::{
    CodecError, Connection, ExpandableBuffer, MessageBuilder, MessageReader, Stream,
    TransportError,
};
use tracing::debug;

/// Largest response frame the client accepts.
pub const MAX_RESPONSE_LENGTH: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid agent address '{0}'")]
    InvalidAddress(String),
    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("agent closed the connection")]
    Disconnected,
    #[error("unexpected response type 0x{0:02x}")]
    UnexpectedResponse(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed response: {0}")]
    Codec(#[from] CodecError),
}

/// Socket to the daemon.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientStream {
    /// Connect to `unix:<path>` or `host:port`.
    pub fn connect(address: &str) -> Result<Self, ClientError> {
        let connect_err = |source| ClientError::Connect {
            address: address.to_string(),
            source,
        };
        if let Some(path) = address.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                return UnixStream::connect(path)
                    .map(ClientStream::Unix)
                    .map_err(connect_err);
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(ClientError::InvalidAddress(address.to_string()));
            }
        }
        if !address.contains(':') {
            return Err(ClientError::InvalidAddress(address.to_string()));
        }
        TcpStream::connect(address)
            .map(ClientStream::Tcp)
            .map_err(connect_err)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.flush(),
        }
    }
}

impl Stream for ClientStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.set_nonblocking(nonblocking),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }
}

/// One session with the daemon.
pub struct AgentClient {
    conn: Connection<ClientStream>,
    response: ExpandableBuffer,
    /// A request went out whose reply has not been read in full.
    reply_pending: bool,
}

impl AgentClient {
    pub fn connect(address: &str) -> Result<Self, ClientError> {
        let stream = ClientStream::connect(address)?;
        debug!(%address, "connected to agent");
        Ok(Self {
            conn: Connection::new(stream, "client", address),
            response: ExpandableBuffer::new(),
            reply_pending: false,
        })
    }

    /// Fail reads that wait longer than `timeout` for the daemon.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.conn
            .stream()
            .set_read_timeout(timeout)
            .map_err(|err| ClientError::Transport(err.into()))
    }

    pub fn lifecycle(
        &mut self,
        action: LifecycleAction,
        component: Component,
        args: &[&str],
    ) -> Result<String, ClientError> {
        let body = join_body(component.id(), args);
        self.send_raw(Action::Lifecycle(action).code(), &body)
    }

    pub fn set_parameter(
        &mut self,
        component: Component,
        name: &str,
        value: &str,
    ) -> Result<String, ClientError> {
        let body = join_body(name, &[value]);
        self.send_raw(Action::SetParameter(component).code(), &body)
    }

    /// Send any action code with a prepared body and wait for the reply.
    ///
    /// If an earlier call timed out, its reply is read and dropped first so
    /// answers stay paired with their requests.
    pub fn send_raw(&mut self, code: u8, body: &[u8]) -> Result<String, ClientError> {
        if self.reply_pending {
            let stale = self.receive()?;
            debug!(len = stale.len(), "discarded late reply");
        }
        self.send(code, body)?;
        self.reply_pending = true;
        self.receive()
    }

    /// End the session. The daemon sends nothing back.
    pub fn finish(mut self) -> Result<(), ClientError> {
        self.send(Action::Finish.code(), &[])
    }

    fn send(&mut self, code: u8, body: &[u8]) -> Result<(), ClientError> {
        let mut msg = MessageBuilder::begin(code);
        msg.append_raw(body)?;
        msg.end_message(&mut self.conn)?;
        self.conn.flush()?;
        self.conn.check_interrupts()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<String, ClientError> {
        let msg_type = self
            .conn
            .read_message(&mut self.response, MAX_RESPONSE_LENGTH)?
            .ok_or(ClientError::Disconnected)?;
        self.reply_pending = false;
        if msg_type != RESPONSE_MESSAGE {
            return Err(ClientError::UnexpectedResponse(msg_type));
        }
        let mut reader = MessageReader::new(&self.response);
        let text = reader.get_counted_text()?.to_string();
        reader.verify_fully_consumed()?;
        Ok(text)
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}
