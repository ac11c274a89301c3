//! Typed fields inside a message body.
//!
//! Integers go out most-significant byte first. Floats are sent as the
//! integer with the same bit pattern, so both ends only have to agree on
//! IEEE-754 layout, never on byte order.

use thiserror::Error;

use crate::buffer::ExpandableBuffer;
use crate::transport::{Connection, Stream, TransportError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("no data left in message: wanted {wanted} byte(s), {remaining} remaining")]
    Overread { wanted: usize, remaining: usize },
    #[error("invalid message format: {remaining} unread byte(s) at end of message")]
    TrailingBytes { remaining: usize },
    #[error("invalid counted-text length {0}")]
    InvalidLength(i32),
    #[error("invalid string in message: missing terminator")]
    MissingTerminator,
    #[error("invalid string in message: not valid UTF-8")]
    InvalidUtf8,
    #[error("string contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("cannot enlarge buffer containing {current} bytes by {requested} more bytes")]
    TooLarge { current: usize, requested: usize },
}

/// Writer side: accumulates one outgoing message.
#[derive(Debug)]
pub struct MessageBuilder {
    msg_type: u8,
    body: ExpandableBuffer,
}

impl MessageBuilder {
    pub fn begin(msg_type: u8) -> Self {
        Self {
            msg_type,
            body: ExpandableBuffer::new(),
        }
    }

    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    pub fn body(&self) -> &ExpandableBuffer {
        &self.body
    }

    pub fn append_int8(&mut self, value: u8) -> Result<&mut Self, CodecError> {
        self.body.append_byte(value)?;
        Ok(self)
    }

    pub fn append_int16(&mut self, value: i16) -> Result<&mut Self, CodecError> {
        self.body.append(&value.to_be_bytes())?;
        Ok(self)
    }

    pub fn append_int32(&mut self, value: i32) -> Result<&mut Self, CodecError> {
        self.body.append(&value.to_be_bytes())?;
        Ok(self)
    }

    pub fn append_int64(&mut self, value: i64) -> Result<&mut Self, CodecError> {
        self.body.append(&value.to_be_bytes())?;
        Ok(self)
    }

    pub fn append_float4(&mut self, value: f32) -> Result<&mut Self, CodecError> {
        self.append_int32(value.to_bits() as i32)
    }

    pub fn append_float8(&mut self, value: f64) -> Result<&mut Self, CodecError> {
        self.append_int64(value.to_bits() as i64)
    }

    /// 4-byte length followed by the raw bytes.
    pub fn append_counted_text(&mut self, text: &[u8]) -> Result<&mut Self, CodecError> {
        let len = i32::try_from(text.len()).map_err(|_| CodecError::TooLarge {
            current: self.body.len(),
            requested: text.len(),
        })?;
        self.body.reserve(4 + text.len())?;
        self.append_int32(len)?;
        self.body.append(text)?;
        Ok(self)
    }

    /// The string's bytes followed by a NUL terminator.
    pub fn append_cstring(&mut self, text: &str) -> Result<&mut Self, CodecError> {
        if text.as_bytes().contains(&0) {
            return Err(CodecError::EmbeddedNul);
        }
        self.body.reserve(text.len() + 1)?;
        self.body.append(text.as_bytes())?;
        self.body.append_byte(0)?;
        Ok(self)
    }

    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<&mut Self, CodecError> {
        self.body.append(bytes)?;
        Ok(self)
    }

    /// Queue the finished message on `conn`.
    pub fn end_message<S: Stream>(self, conn: &mut Connection<S>) -> Result<(), TransportError> {
        conn.write_message(self.msg_type, self.body.as_bytes())
    }
}

/// Reader side: walks one received message body with a cursor.
#[derive(Debug)]
pub struct MessageReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(body: &'a ExpandableBuffer) -> Self {
        Self::from_bytes(body.as_bytes())
    }

    pub fn from_bytes(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    fn take(&mut self, wanted: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if wanted > remaining {
            return Err(CodecError::Overread { wanted, remaining });
        }
        let bytes = &self.data[self.cursor..self.cursor + wanted];
        self.cursor += wanted;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_int8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_int16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn get_int32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_int64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_float4(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.get_int32()? as u32))
    }

    pub fn get_float8(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.get_int64()? as u64))
    }

    /// Raw bytes of a counted field. On error the cursor stays at the
    /// length word.
    pub fn get_counted_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let start = self.cursor;
        let len = self.get_int32()?;
        let field = if len < 0 {
            Err(CodecError::InvalidLength(len))
        } else {
            self.take(len as usize)
        };
        if field.is_err() {
            self.cursor = start;
        }
        field
    }

    pub fn get_counted_text(&mut self) -> Result<&'a str, CodecError> {
        let start = self.cursor;
        let bytes = self.get_counted_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| {
            self.cursor = start;
            CodecError::InvalidUtf8
        })
    }

    /// Bytes up to the next NUL; the terminator is consumed but not returned.
    pub fn get_cstring(&mut self) -> Result<&'a str, CodecError> {
        let rest = &self.data[self.cursor..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(CodecError::MissingTerminator)?;
        let text = std::str::from_utf8(&rest[..end]).map_err(|_| CodecError::InvalidUtf8)?;
        self.cursor += end + 1;
        Ok(text)
    }

    pub fn get_raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    /// Everything not read yet.
    pub fn get_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.cursor..];
        self.cursor = self.data.len();
        rest
    }

    /// Fails if any byte of the body was left unread.
    pub fn verify_fully_consumed(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(CodecError::TrailingBytes { remaining }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_fields_round_trip() {
        let mut msg = MessageBuilder::begin(b'M');
        msg.append_int8(0xfe)
            .and_then(|m| m.append_int16(-2))
            .and_then(|m| m.append_int32(i32::MIN))
            .and_then(|m| m.append_int64(0x0102_0304_0506_0708))
            .and_then(|m| m.append_float4(-1.5))
            .and_then(|m| m.append_float8(f64::MAX))
            .and_then(|m| m.append_counted_text("héllo".as_bytes()))
            .and_then(|m| m.append_cstring("zookeeper"))
            .and_then(|m| m.append_raw(b"\x01\x02"))
            .expect("build");

        let mut reader = MessageReader::new(msg.body());
        assert_eq!(reader.get_int8(), Ok(0xfe));
        assert_eq!(reader.get_int16(), Ok(-2));
        assert_eq!(reader.get_int32(), Ok(i32::MIN));
        assert_eq!(reader.get_int64(), Ok(0x0102_0304_0506_0708));
        assert_eq!(reader.get_float4(), Ok(-1.5));
        assert_eq!(reader.get_float8(), Ok(f64::MAX));
        assert_eq!(reader.get_counted_text(), Ok("héllo"));
        assert_eq!(reader.get_cstring(), Ok("zookeeper"));
        assert!(reader.verify_fully_consumed().is_err());
        assert_eq!(reader.get_raw(2), Ok(&b"\x01\x02"[..]));
        assert_eq!(reader.verify_fully_consumed(), Ok(()));
    }

    #[test]
    fn integers_are_big_endian() {
        let mut msg = MessageBuilder::begin(b'x');
        msg.append_int16(0x0102)
            .and_then(|m| m.append_int32(0x0304_0506))
            .and_then(|m| m.append_float4(1.0))
            .expect("build");
        assert_eq!(
            msg.body().as_bytes(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x3f, 0x80, 0x00, 0x00]
        );
    }

    #[test]
    fn nan_payload_survives() {
        let weird = f64::from_bits(0x7ff8_dead_beef_0001);
        let mut msg = MessageBuilder::begin(b'x');
        msg.append_float8(weird).expect("build");
        let mut reader = MessageReader::new(msg.body());
        assert_eq!(reader.get_float8().expect("read").to_bits(), weird.to_bits());
    }

    #[test]
    fn overread_is_reported_without_moving_the_cursor() {
        let mut reader = MessageReader::from_bytes(&[0, 0, 1]);
        assert_eq!(
            reader.get_int32(),
            Err(CodecError::Overread {
                wanted: 4,
                remaining: 3
            })
        );
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.get_int16(), Ok(0));
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn trailing_bytes_fail_verification() {
        let mut reader = MessageReader::from_bytes(b"\x00\x07pad");
        assert_eq!(reader.get_int16(), Ok(7));
        assert_eq!(
            reader.verify_fully_consumed(),
            Err(CodecError::TrailingBytes { remaining: 3 })
        );
    }

    #[test]
    fn cstring_rules() {
        let mut msg = MessageBuilder::begin(b'x');
        assert_eq!(
            msg.append_cstring("a\0b").map(|_| ()),
            Err(CodecError::EmbeddedNul)
        );
        assert!(msg.body().is_empty());

        let mut reader = MessageReader::from_bytes(b"no terminator");
        assert_eq!(reader.get_cstring(), Err(CodecError::MissingTerminator));
    }

    #[test]
    fn negative_counted_length_is_rejected() {
        let bytes = (-1i32).to_be_bytes();
        let mut reader = MessageReader::from_bytes(&bytes);
        assert_eq!(reader.get_counted_text(), Err(CodecError::InvalidLength(-1)));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn short_counted_field_leaves_the_cursor_at_its_length() {
        let mut wire = 7i16.to_be_bytes().to_vec();
        wire.extend_from_slice(&10i32.to_be_bytes());
        wire.extend_from_slice(b"abc");
        let mut reader = MessageReader::from_bytes(&wire);
        assert_eq!(reader.get_int16(), Ok(7));

        assert_eq!(
            reader.get_counted_bytes(),
            Err(CodecError::Overread {
                wanted: 10,
                remaining: 3
            })
        );
        assert_eq!(reader.position(), 2);
        assert_eq!(reader.get_int32(), Ok(10));
        assert_eq!(reader.remaining(), 3);
    }

    #[test]
    fn counted_text_must_be_utf8() {
        let mut msg = MessageBuilder::begin(b'x');
        msg.append_counted_text(&[0xff, 0xfe]).expect("build");
        let mut reader = MessageReader::new(msg.body());
        assert_eq!(reader.get_counted_text(), Err(CodecError::InvalidUtf8));
    }
}
