//! Seam for channel security.
//!
//! Once a [`SecureChannel`] has been negotiated on a
//! [`Connection`](crate::Connection), every byte in either direction goes
//! through it instead of straight to the socket. The daemon itself only
//! ships [`PlainChannel`]; real implementations live with whoever manages
//! credentials.

use std::io;

use thiserror::Error;

use crate::transport::Stream;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("secure channel handshake failed: {0}")]
    Handshake(String),
    #[error("I/O error during secure channel handshake")]
    Io(#[from] io::Error),
}

pub trait SecureChannel: Send {
    /// Runs once, before any protocol traffic.
    fn handshake(&mut self, stream: &mut dyn Stream) -> Result<(), SecurityError>;

    /// Same contract as [`io::Read::read`], including `WouldBlock`.
    fn secure_read(&mut self, stream: &mut dyn Stream, buf: &mut [u8]) -> io::Result<usize>;

    /// Same contract as [`io::Write::write`], including `WouldBlock`.
    fn secure_write(&mut self, stream: &mut dyn Stream, buf: &[u8]) -> io::Result<usize>;

    fn is_encrypted(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Pass-through channel used when no encryption is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainChannel;

impl SecureChannel for PlainChannel {
    fn handshake(&mut self, _stream: &mut dyn Stream) -> Result<(), SecurityError> {
        Ok(())
    }

    fn secure_read(&mut self, stream: &mut dyn Stream, buf: &mut [u8]) -> io::Result<usize> {
        stream.read(buf)
    }

    fn secure_write(&mut self, stream: &mut dyn Stream, buf: &[u8]) -> io::Result<usize> {
        stream.write(buf)
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}
