//! Buffered, framed transport over one client connection.
//!
//! Inbound data is pulled through a fixed receive buffer; outbound messages
//! are queued in a growable send buffer and drained as the socket allows.
//! Every inbound message is bracketed by [`Connection::start_message_read`]
//! and [`Connection::end_message_read`] so a half-consumed frame can never be
//! mistaken for the start of the next one.
//!
//! Send failures do not surface in the middle of a message. The connection
//! is marked lost, buffered output is thrown away, and the loss is reported
//! by [`Connection::check_interrupts`] at the caller's next safe point.

use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::net::TcpStream;

use thiserror::Error;
use tracing::{debug, trace};

use crate::buffer::ExpandableBuffer;
use crate::codec::CodecError;
use crate::secure::{SecureChannel, SecurityError};

pub const RECV_BUFFER_SIZE: usize = 8192;
pub const SEND_BUFFER_SIZE: usize = 8192;

/// Size of the self-inclusive length prefix.
const LENGTH_PREFIX: usize = 4;

/// How far a would-blocked inbound frame got.
#[derive(Debug, Default)]
struct PartialFrame {
    /// Set when the frame was started by [`Connection::read_message`].
    msg_type: Option<u8>,
    prefix: [u8; LENGTH_PREFIX],
    prefix_filled: usize,
    /// Body length, known once the prefix is complete.
    payload: Option<usize>,
    body_filled: usize,
}

/// A byte stream a [`Connection`] can run over.
pub trait Stream: Read + Write {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

#[cfg(unix)]
impl Stream for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

/// Coarse classification used to decide how loudly to report an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Would block; retry when the socket is ready again.
    Transient,
    /// The peer went away.
    PeerTerminated,
    /// The byte stream no longer makes sense; the connection must go.
    ProtocolViolation,
    Io,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not receive data from client: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected EOF within message")]
    UnexpectedEof,
    #[error("terminating connection because protocol synchronization was lost")]
    ProtocolSync,
    #[error("attempted to read message data outside of a message")]
    NotReadingMessage,
    #[error("invalid message length {0}")]
    InvalidLength(u32),
    #[error("message length {len} exceeds maximum {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("connection to client lost")]
    ConnectionLost,
    #[error("operation would block")]
    WouldBlock,
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::WouldBlock => ErrorKind::Transient,
            TransportError::UnexpectedEof | TransportError::ConnectionLost => {
                ErrorKind::PeerTerminated
            }
            TransportError::Io(err) => match err.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => ErrorKind::PeerTerminated,
                io::ErrorKind::WouldBlock => ErrorKind::Transient,
                _ => ErrorKind::Io,
            },
            TransportError::ProtocolSync
            | TransportError::NotReadingMessage
            | TransportError::InvalidLength(_)
            | TransportError::MessageTooLarge { .. }
            | TransportError::Codec(_) => ErrorKind::ProtocolViolation,
            TransportError::Security(_) => ErrorKind::Io,
        }
    }
}

pub struct Connection<S> {
    stream: S,
    secure: Option<Box<dyn SecureChannel>>,
    local: String,
    remote: String,
    nonblocking: bool,

    recv_buf: Box<[u8]>,
    /// Next unread byte in `recv_buf`.
    recv_pointer: usize,
    /// End of valid data in `recv_buf`.
    recv_length: usize,

    send_buf: Vec<u8>,
    /// Next byte to hand to the socket.
    send_start: usize,
    /// End of queued data in `send_buf`.
    send_pointer: usize,

    reading_message: bool,
    partial: Option<PartialFrame>,
    connection_lost: bool,
    loss_reported: bool,
}

impl<S: Stream> Connection<S> {
    /// Wrap a connected stream. The labels are only used for logging.
    pub fn new(stream: S, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            stream,
            secure: None,
            local: local.into(),
            remote: remote.into(),
            nonblocking: false,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            recv_pointer: 0,
            recv_length: 0,
            send_buf: vec![0u8; SEND_BUFFER_SIZE],
            send_start: 0,
            send_pointer: 0,
            reading_message: false,
            partial: None,
            connection_lost: false,
            loss_reported: false,
        }
    }

    pub fn local_label(&self) -> &str {
        &self.local
    }

    pub fn remote_label(&self) -> &str {
        &self.remote
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        if self.nonblocking != nonblocking {
            self.stream.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    /// Run the channel's handshake and route all further I/O through it.
    pub fn negotiate(&mut self, mut channel: Box<dyn SecureChannel>) -> Result<(), TransportError> {
        channel.handshake(&mut self.stream)?;
        debug!(
            remote = %self.remote,
            channel = channel.name(),
            encrypted = channel.is_encrypted(),
            "secure channel established"
        );
        self.secure = Some(channel);
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.secure.as_ref().is_some_and(|c| c.is_encrypted())
    }

    pub fn is_reading_message(&self) -> bool {
        self.reading_message
    }

    /// Open the bracket around one inbound message.
    pub fn start_message_read(&mut self) -> Result<(), TransportError> {
        if self.reading_message {
            return Err(TransportError::ProtocolSync);
        }
        self.reading_message = true;
        Ok(())
    }

    pub fn end_message_read(&mut self) {
        debug_assert!(self.reading_message, "end_message_read without start");
        self.reading_message = false;
    }

    fn ensure_reading(&self) -> Result<(), TransportError> {
        if self.reading_message {
            Ok(())
        } else {
            Err(TransportError::NotReadingMessage)
        }
    }

    /// Refill the receive buffer. Returns `false` on end of stream.
    fn fill_recv_buffer(&mut self) -> Result<bool, TransportError> {
        if self.recv_pointer > 0 {
            if self.recv_length > self.recv_pointer {
                self.recv_buf
                    .copy_within(self.recv_pointer..self.recv_length, 0);
            }
            self.recv_length -= self.recv_pointer;
            self.recv_pointer = 0;
        }

        loop {
            let target = &mut self.recv_buf[self.recv_length..];
            let result = match self.secure.as_mut() {
                Some(channel) => channel.secure_read(&mut self.stream, target),
                None => self.stream.read(target),
            };
            match result {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.recv_length += n;
                    trace!(bytes = n, "received");
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // A read timeout surfaces as TimedOut on some platforms.
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(TransportError::WouldBlock)
                }
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    /// Next byte of the current message, or `None` at a clean end of stream.
    pub fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        self.ensure_reading()?;
        match self.peek_byte()? {
            Some(byte) => {
                self.recv_pointer += 1;
                Ok(Some(byte))
            }
            None => Ok(None),
        }
    }

    /// Like [`read_byte`](Self::read_byte) without consuming it.
    pub fn peek_byte(&mut self) -> Result<Option<u8>, TransportError> {
        self.ensure_reading()?;
        while self.recv_pointer >= self.recv_length {
            if !self.fill_recv_buffer()? {
                return Ok(None);
            }
        }
        Ok(Some(self.recv_buf[self.recv_pointer]))
    }

    /// Fill `out` completely; end of stream here is an error.
    ///
    /// If `out` fits in the receive buffer nothing is consumed until all of
    /// it has arrived, so a [`TransportError::WouldBlock`] can simply be
    /// retried with the same arguments.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), TransportError> {
        self.ensure_reading()?;
        if out.len() <= self.recv_buf.len() {
            while self.recv_length - self.recv_pointer < out.len() {
                if !self.fill_recv_buffer()? {
                    return Err(TransportError::UnexpectedEof);
                }
            }
            out.copy_from_slice(&self.recv_buf[self.recv_pointer..self.recv_pointer + out.len()]);
            self.recv_pointer += out.len();
            return Ok(());
        }

        let mut filled = 0;
        while filled < out.len() {
            filled += self.read_available(&mut out[filled..])?;
        }
        Ok(())
    }

    /// Copy at least one byte into `out`, as many as are at hand.
    fn read_available(&mut self, out: &mut [u8]) -> Result<usize, TransportError> {
        while self.recv_pointer >= self.recv_length {
            if !self.fill_recv_buffer()? {
                return Err(TransportError::UnexpectedEof);
            }
        }
        let take = (self.recv_length - self.recv_pointer).min(out.len());
        out[..take].copy_from_slice(&self.recv_buf[self.recv_pointer..self.recv_pointer + take]);
        self.recv_pointer += take;
        Ok(take)
    }

    /// Read a length-prefixed body into `body` (which is cleared first) and
    /// close the message bracket.
    ///
    /// `max_length` bounds the self-inclusive length, and is checked before
    /// anything is allocated for the body.
    ///
    /// On a non-blocking connection this may fail with
    /// [`TransportError::WouldBlock`] part way through the frame. What was
    /// read so far is kept, and calling again with the same `body` (without
    /// reopening the bracket) picks up where the last call stopped.
    pub fn read_framed_message(
        &mut self,
        body: &mut ExpandableBuffer,
        max_length: usize,
    ) -> Result<(), TransportError> {
        self.ensure_reading()?;
        let mut frame = self.partial.take().unwrap_or_default();
        match self.continue_frame(&mut frame, body, max_length) {
            Ok(()) => {
                self.end_message_read();
                Ok(())
            }
            Err(TransportError::WouldBlock) => {
                trace!(
                    prefix = frame.prefix_filled,
                    body = frame.body_filled,
                    "frame suspended"
                );
                self.partial = Some(frame);
                Err(TransportError::WouldBlock)
            }
            Err(err) => Err(err),
        }
    }

    fn continue_frame(
        &mut self,
        frame: &mut PartialFrame,
        body: &mut ExpandableBuffer,
        max_length: usize,
    ) -> Result<(), TransportError> {
        while frame.prefix_filled < LENGTH_PREFIX {
            let n = self.read_available(&mut frame.prefix[frame.prefix_filled..])?;
            frame.prefix_filled += n;
        }

        let payload = match frame.payload {
            Some(payload) => payload,
            None => {
                let len = u32::from_be_bytes(frame.prefix);
                if (len as usize) < LENGTH_PREFIX {
                    return Err(TransportError::InvalidLength(len));
                }
                if len as usize > max_length {
                    return Err(TransportError::MessageTooLarge {
                        len: len as usize,
                        max: max_length,
                    });
                }
                body.clear();
                let payload = len as usize - LENGTH_PREFIX;
                if payload > 0 {
                    body.grow_by(payload)?;
                }
                frame.payload = Some(payload);
                payload
            }
        };

        while frame.body_filled < payload {
            let target = &mut body.as_bytes_mut()[frame.body_filled..payload];
            let n = self.read_available(target)?;
            frame.body_filled += n;
        }
        Ok(())
    }

    /// Read one whole inbound unit: the type byte plus its framed body.
    ///
    /// Returns `None` if the peer closed the connection cleanly before
    /// sending a type byte. A [`TransportError::WouldBlock`] is resumable in
    /// the same way as for [`read_framed_message`](Self::read_framed_message).
    pub fn read_message(
        &mut self,
        body: &mut ExpandableBuffer,
        max_length: usize,
    ) -> Result<Option<u8>, TransportError> {
        if let Some(msg_type) = self.partial.as_ref().and_then(|frame| frame.msg_type) {
            self.read_framed_message(body, max_length)?;
            return Ok(Some(msg_type));
        }

        self.start_message_read()?;
        let msg_type = match self.read_byte() {
            Ok(Some(msg_type)) => msg_type,
            Ok(None) => {
                self.end_message_read();
                return Ok(None);
            }
            Err(TransportError::WouldBlock) => {
                // Nothing consumed yet; the next call starts afresh.
                self.end_message_read();
                return Err(TransportError::WouldBlock);
            }
            Err(err) => return Err(err),
        };
        self.partial = Some(PartialFrame {
            msg_type: Some(msg_type),
            ..PartialFrame::default()
        });
        self.read_framed_message(body, max_length)?;
        Ok(Some(msg_type))
    }

    /// Queue one framed message and try to push it out.
    ///
    /// After the connection has been lost this silently discards the
    /// message; the loss itself is reported by
    /// [`check_interrupts`](Self::check_interrupts).
    pub fn write_message(&mut self, msg_type: u8, body: &[u8]) -> Result<(), TransportError> {
        let total = body.len() + LENGTH_PREFIX;
        let len = u32::try_from(total).map_err(|_| TransportError::MessageTooLarge {
            len: total,
            max: u32::MAX as usize,
        })?;
        if self.connection_lost {
            return Ok(());
        }

        self.put_bytes(&[msg_type]);
        self.put_bytes(&len.to_be_bytes());
        self.put_bytes(body);
        self.drain()
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        let needed = self.send_pointer + bytes.len();
        if needed > self.send_buf.len() {
            // Reclaim the already-sent prefix before growing.
            if self.send_start > 0 {
                self.send_buf.copy_within(self.send_start..self.send_pointer, 0);
                self.send_pointer -= self.send_start;
                self.send_start = 0;
            }
            let needed = self.send_pointer + bytes.len();
            if needed > self.send_buf.len() {
                let new_len = needed.max(self.send_buf.len() * 2);
                self.send_buf.resize(new_len, 0);
            }
        }
        self.send_buf[self.send_pointer..self.send_pointer + bytes.len()].copy_from_slice(bytes);
        self.send_pointer += bytes.len();
    }

    /// Push buffered output to the socket until it is empty or the socket
    /// would block. Hard errors mark the connection lost.
    fn drain(&mut self) -> Result<(), TransportError> {
        while self.send_start < self.send_pointer {
            let pending = &self.send_buf[self.send_start..self.send_pointer];
            let result = match self.secure.as_mut() {
                Some(channel) => channel.secure_write(&mut self.stream, pending),
                None => self.stream.write(pending),
            };
            match result {
                Ok(0) => {
                    self.mark_lost(io::ErrorKind::WriteZero.into());
                    return Ok(());
                }
                Ok(n) => {
                    self.send_start += n;
                    trace!(bytes = n, "sent");
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // Normal flow control: the rest goes out on a later flush.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    self.mark_lost(err);
                    return Ok(());
                }
            }
        }
        self.send_start = 0;
        self.send_pointer = 0;
        Ok(())
    }

    fn mark_lost(&mut self, err: io::Error) {
        debug!(remote = %self.remote, %err, "could not send data to client");
        self.connection_lost = true;
        self.send_start = 0;
        self.send_pointer = 0;
    }

    /// Drain the send buffer in the connection's current blocking mode.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.drain()?;
        let _ = self.stream.flush();
        Ok(())
    }

    /// Send whatever the socket accepts right now without blocking.
    pub fn flush_if_writable(&mut self) -> Result<(), TransportError> {
        if !self.is_send_pending() {
            return Ok(());
        }
        let was_nonblocking = self.nonblocking;
        self.set_nonblocking(true)?;
        let result = self.drain();
        self.set_nonblocking(was_nonblocking)?;
        result
    }

    pub fn is_send_pending(&self) -> bool {
        self.send_start < self.send_pointer
    }

    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost
    }

    /// Report a connection lost during an earlier write, once.
    pub fn check_interrupts(&mut self) -> Result<(), TransportError> {
        if self.connection_lost && !self.loss_reported {
            self.loss_reported = true;
            return Err(TransportError::ConnectionLost);
        }
        Ok(())
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("secure", &self.secure.as_ref().map(|c| c.name()))
            .field("recv_pending", &(self.recv_length - self.recv_pointer))
            .field("send_pending", &(self.send_pointer - self.send_start))
            .field("reading_message", &self.reading_message)
            .field("partial_frame", &self.partial.is_some())
            .field("connection_lost", &self.connection_lost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory stream that hands out input in fixed-size chunks and can be
    /// told to refuse or fail writes.
    #[derive(Default)]
    struct ChunkedStream {
        input: VecDeque<u8>,
        chunk: usize,
        output: Vec<u8>,
        write_chunk: usize,
        would_block_writes: usize,
        fail_writes: bool,
        /// Input offset at which one read reports WouldBlock.
        stall_at: Option<usize>,
        consumed: usize,
    }

    impl ChunkedStream {
        fn with_input(input: &[u8], chunk: usize) -> Self {
            Self {
                input: input.iter().copied().collect(),
                chunk,
                write_chunk: usize::MAX,
                ..Self::default()
            }
        }
    }

    impl Read for ChunkedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut n = buf.len().min(self.chunk).min(self.input.len());
            if let Some(stall) = self.stall_at {
                if stall == self.consumed {
                    self.stall_at = None;
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                n = n.min(stall - self.consumed);
            }
            for slot in buf.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap_or_default();
            }
            self.consumed += n;
            Ok(n)
        }
    }

    impl Write for ChunkedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            if self.would_block_writes > 0 {
                self.would_block_writes -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_chunk);
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Stream for ChunkedStream {
        fn set_nonblocking(&self, _nonblocking: bool) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![msg_type];
        out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn write_message_frames_type_length_body() {
        let mut conn = Connection::new(ChunkedStream::with_input(&[], 1), "l", "r");
        conn.write_message(b'M', b"abc").expect("write");
        assert_eq!(conn.stream().output, frame(b'M', b"abc"));
        assert!(!conn.is_send_pending());
    }

    #[test]
    fn back_to_back_frames_survive_one_byte_delivery() {
        let mut wire = frame(b'h', b"first\0one");
        wire.extend(frame(b'X', b""));
        let mut conn = Connection::new(ChunkedStream::with_input(&wire, 1), "l", "r");
        let mut body = ExpandableBuffer::new();

        assert_eq!(conn.read_message(&mut body, 64).expect("first"), Some(b'h'));
        assert_eq!(body.as_bytes(), b"first\0one");
        assert_eq!(body.as_bytes_with_nul(), b"first\0one\0");
        assert!(!conn.is_reading_message());

        assert_eq!(conn.read_message(&mut body, 64).expect("second"), Some(b'X'));
        assert!(body.is_empty());

        assert_eq!(conn.read_message(&mut body, 64).expect("eof"), None);
    }

    #[test]
    fn frame_interrupted_by_would_block_resumes_on_retry() {
        // Stall in the length prefix, then again inside the body.
        for stall in [3, 7] {
            let mut stream = ChunkedStream::with_input(&frame(b'h', b"abcde"), 64);
            stream.stall_at = Some(stall);
            let mut conn = Connection::new(stream, "l", "r");
            conn.set_nonblocking(true).expect("nonblocking");
            let mut body = ExpandableBuffer::new();

            let err = conn.read_message(&mut body, 64).expect_err("stalled");
            assert!(matches!(err, TransportError::WouldBlock));
            assert_eq!(err.kind(), ErrorKind::Transient);
            assert!(conn.is_reading_message());

            assert_eq!(conn.read_message(&mut body, 64).expect("resumed"), Some(b'h'));
            assert_eq!(body.as_bytes(), b"abcde");
            assert!(!conn.is_reading_message());
            assert_eq!(conn.read_message(&mut body, 64).expect("eof"), None);
        }
    }

    #[test]
    fn would_block_before_the_type_byte_leaves_no_open_message() {
        let mut stream = ChunkedStream::with_input(&frame(b'X', b""), 64);
        stream.stall_at = Some(0);
        let mut conn = Connection::new(stream, "l", "r");
        let mut body = ExpandableBuffer::new();

        let err = conn.read_message(&mut body, 64).expect_err("stalled");
        assert!(matches!(err, TransportError::WouldBlock));
        assert!(!conn.is_reading_message());
        assert_eq!(conn.read_message(&mut body, 64).expect("retry"), Some(b'X'));
    }

    #[test]
    fn read_bytes_consumes_nothing_until_complete() {
        let mut stream = ChunkedStream::with_input(b"wxyz", 64);
        stream.stall_at = Some(2);
        let mut conn = Connection::new(stream, "l", "r");
        conn.start_message_read().expect("start");

        let mut out = [0u8; 4];
        assert!(matches!(
            conn.read_bytes(&mut out),
            Err(TransportError::WouldBlock)
        ));
        conn.read_bytes(&mut out).expect("retry");
        assert_eq!(&out, b"wxyz");
    }

    #[test]
    fn receive_buffer_is_left_justified_across_refills() {
        let big = vec![7u8; RECV_BUFFER_SIZE + 100];
        let wire = frame(b'M', &big);
        let mut conn = Connection::new(ChunkedStream::with_input(&wire, 3000), "l", "r");
        let mut body = ExpandableBuffer::new();
        assert_eq!(
            conn.read_message(&mut body, RECV_BUFFER_SIZE * 2).expect("read"),
            Some(b'M')
        );
        assert_eq!(body.as_bytes(), &big[..]);
    }

    #[test]
    fn length_of_exactly_four_is_an_empty_body() {
        let wire = [0u8, 0, 0, 4];
        let mut conn = Connection::new(ChunkedStream::with_input(&wire, 8), "l", "r");
        let mut body = ExpandableBuffer::new();
        body.append(b"stale").expect("seed");
        conn.start_message_read().expect("start");
        conn.read_framed_message(&mut body, 16).expect("read");
        assert!(body.is_empty());
    }

    #[test]
    fn length_below_four_is_malformed() {
        for len in 0u32..4 {
            let wire = len.to_be_bytes();
            let mut conn = Connection::new(ChunkedStream::with_input(&wire, 8), "l", "r");
            conn.start_message_read().expect("start");
            let err = conn
                .read_framed_message(&mut ExpandableBuffer::new(), 16)
                .expect_err("must reject");
            assert!(matches!(err, TransportError::InvalidLength(l) if l == len));
            assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        }
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let wire = (u32::MAX).to_be_bytes();
        let mut conn = Connection::new(ChunkedStream::with_input(&wire, 8), "l", "r");
        let mut body = ExpandableBuffer::new();
        let capacity = body.capacity();
        conn.start_message_read().expect("start");
        let err = conn
            .read_framed_message(&mut body, 4096)
            .expect_err("must reject");
        assert!(matches!(
            err,
            TransportError::MessageTooLarge { max: 4096, .. }
        ));
        assert_eq!(body.capacity(), capacity);
    }

    #[test]
    fn eof_inside_a_frame_is_unexpected() {
        let wire = [b'h', 0, 0, 0, 10, b'a', b'b'];
        let mut conn = Connection::new(ChunkedStream::with_input(&wire, 2), "l", "r");
        let err = conn
            .read_message(&mut ExpandableBuffer::new(), 64)
            .expect_err("truncated");
        assert!(matches!(err, TransportError::UnexpectedEof));
        assert_eq!(err.kind(), ErrorKind::PeerTerminated);
    }

    #[test]
    fn bracket_rules_are_enforced() {
        let mut conn = Connection::new(ChunkedStream::with_input(b"xy", 8), "l", "r");
        assert!(matches!(
            conn.read_byte(),
            Err(TransportError::NotReadingMessage)
        ));
        conn.start_message_read().expect("start");
        assert!(matches!(
            conn.start_message_read(),
            Err(TransportError::ProtocolSync)
        ));
        assert_eq!(conn.peek_byte().expect("peek"), Some(b'x'));
        assert_eq!(conn.read_byte().expect("read"), Some(b'x'));
        assert_eq!(conn.read_byte().expect("read"), Some(b'y'));
        assert_eq!(conn.read_byte().expect("eof"), None);
    }

    #[test]
    fn partial_writes_stay_queued_until_flushed() {
        let mut stream = ChunkedStream::with_input(&[], 1);
        stream.write_chunk = 3;
        stream.would_block_writes = 1;
        let mut conn = Connection::new(stream, "l", "r");

        conn.write_message(b'M', b"hello").expect("write");
        assert!(conn.is_send_pending());
        assert!(conn.stream().output.is_empty());

        conn.write_message(b'M', b"world").expect("write");
        assert!(!conn.is_send_pending());
        let mut expected = frame(b'M', b"hello");
        expected.extend(frame(b'M', b"world"));
        assert_eq!(conn.stream().output, expected);
    }

    #[test]
    fn send_buffer_grows_for_large_messages() {
        let mut stream = ChunkedStream::with_input(&[], 1);
        stream.would_block_writes = 1;
        let mut conn = Connection::new(stream, "l", "r");
        let big = vec![1u8; SEND_BUFFER_SIZE * 3];
        conn.write_message(b'M', &big).expect("write");
        assert!(conn.is_send_pending());
        conn.flush_if_writable().expect("flush");
        assert!(!conn.is_send_pending());
        assert_eq!(conn.stream().output, frame(b'M', &big));
    }

    #[test]
    fn hard_write_error_is_reported_once_at_the_next_check() {
        let mut stream = ChunkedStream::with_input(&[], 1);
        stream.fail_writes = true;
        let mut conn = Connection::new(stream, "l", "r");

        conn.write_message(b'M', b"lost").expect("write errors are deferred");
        assert!(conn.is_connection_lost());
        assert!(!conn.is_send_pending());

        conn.write_message(b'M', b"dropped").expect("discarded");
        let err = conn.check_interrupts().expect_err("loss reported");
        assert!(matches!(err, TransportError::ConnectionLost));
        assert!(conn.check_interrupts().is_ok());
    }

    /// Toy channel: XORs every byte so the wire differs from the payload.
    struct XorChannel(u8);

    impl SecureChannel for XorChannel {
        fn handshake(&mut self, stream: &mut dyn Stream) -> Result<(), SecurityError> {
            stream.write_all(&[self.0])?;
            Ok(())
        }

        fn secure_read(&mut self, stream: &mut dyn Stream, buf: &mut [u8]) -> io::Result<usize> {
            let n = stream.read(buf)?;
            buf[..n].iter_mut().for_each(|b| *b ^= self.0);
            Ok(n)
        }

        fn secure_write(&mut self, stream: &mut dyn Stream, buf: &[u8]) -> io::Result<usize> {
            let scrambled: Vec<u8> = buf.iter().map(|b| b ^ self.0).collect();
            stream.write(&scrambled)
        }

        fn is_encrypted(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "xor"
        }
    }

    #[test]
    fn negotiated_channel_carries_all_traffic() {
        let key = 0x5a;
        let wire: Vec<u8> = frame(b'M', b"secret").iter().map(|b| b ^ key).collect();
        let mut conn = Connection::new(ChunkedStream::with_input(&wire, 4), "l", "r");
        assert!(!conn.is_secure());
        conn.negotiate(Box::new(XorChannel(key))).expect("handshake");
        assert!(conn.is_secure());

        let mut body = ExpandableBuffer::new();
        assert_eq!(conn.read_message(&mut body, 64).expect("read"), Some(b'M'));
        assert_eq!(body.as_bytes(), b"secret");

        conn.write_message(b'M', b"reply").expect("write");
        let mut expected = vec![key];
        expected.extend(frame(b'M', b"reply").iter().map(|b| b ^ key));
        assert_eq!(conn.stream().output, expected);
    }

    #[test]
    fn io_errors_are_classified() {
        let reset = TransportError::Io(io::ErrorKind::ConnectionReset.into());
        assert_eq!(reset.kind(), ErrorKind::PeerTerminated);
        let other = TransportError::Io(io::ErrorKind::PermissionDenied.into());
        assert_eq!(other.kind(), ErrorKind::Io);
        assert_eq!(TransportError::WouldBlock.kind(), ErrorKind::Transient);
        assert_eq!(TransportError::ProtocolSync.kind(), ErrorKind::ProtocolViolation);
    }
}
