//! Wire layer of the agent protocol.
//!
//! Every unit on the wire is a framed message:
//!
//! ```text
//! [type: u8][length: u32 big-endian, counts itself][length - 4 bytes of body]
//! ```
//!
//! [`Connection`] moves whole frames over a byte stream with explicit
//! buffering in both directions. [`MessageBuilder`] and [`MessageReader`]
//! encode and decode typed fields inside a frame body held in an
//! [`ExpandableBuffer`]. [`protocol`] names the agent's action codes and
//! request layout on top of that.

pub mod buffer;
pub mod codec;
pub mod protocol;
pub mod secure;
pub mod transport;

pub use buffer::{ExpandableBuffer, MAX_ALLOC_SIZE};
pub use codec::{CodecError, MessageBuilder, MessageReader};
pub use secure::{PlainChannel, SecureChannel, SecurityError};
pub use transport::{
    Connection, ErrorKind, Stream, TransportError, RECV_BUFFER_SIZE, SEND_BUFFER_SIZE,
};
