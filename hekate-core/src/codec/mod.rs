//! Wire codecs: typed big-endian primitives over length-prefixed frames.
//!
//! Every protocol message is one frame: a `u32` big-endian length prefix
//! followed by a single type byte and a type-specific body. Integers are
//! big-endian; strings and blobs are `i32` length + raw bytes. Protocol
//! modules implement [`Codec`] over their message enums and the transport
//! moves the resulting payload bytes.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors raised while encoding or decoding protocol frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame ended before the expected data was read.
    #[error("unexpected end of frame ({wanted} more bytes wanted)")]
    Eof {
        /// Bytes the decoder still needed.
        wanted: usize,
    },
    /// String field was not valid UTF-8.
    #[error("invalid utf-8 in string field: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    /// Leading type byte does not match any known message.
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),
    /// Length prefix was negative or otherwise malformed.
    #[error("invalid length prefix: {0}")]
    InvalidLength(i32),
    /// Frame decoded cleanly but trailing bytes remained.
    #[error("frame has {0} undecoded trailing bytes")]
    TrailingBytes(usize),
    /// Field decoded but failed semantic validation.
    #[error("malformed field: {0}")]
    Malformed(String),
}

/// Typed writer producing one frame body.
#[derive(Debug, Default)]
pub struct DataWriter {
    buf: BytesMut,
}

impl DataWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with the given capacity hint.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Consumes the writer, yielding the encoded body.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_u128(&mut self, value: u128) {
        self.buf.put_u128(value);
    }

    /// Writes a string as `i32` length + UTF-8 bytes.
    pub fn write_str(&mut self, value: &str) {
        self.buf.put_i32(value.len() as i32);
        self.buf.put_slice(value.as_bytes());
    }

    /// Writes a blob as `i32` length + raw bytes.
    pub fn write_blob(&mut self, value: &[u8]) {
        self.buf.put_i32(value.len() as i32);
        self.buf.put_slice(value);
    }
}

/// Typed reader over one frame body.
#[derive(Debug)]
pub struct DataReader {
    buf: Bytes,
}

impl DataReader {
    /// Wraps a frame body for decoding.
    #[must_use]
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes left to decode.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, wanted: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < wanted {
            Err(CodecError::Eof {
                wanted: wanted - self.buf.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_u128(&mut self) -> Result<u128, CodecError> {
        self.need(16)?;
        Ok(self.buf.get_u128())
    }

    /// Reads an `i32` length + UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_blob()?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Reads an `i32` length + raw bytes.
    pub fn read_blob(&mut self) -> Result<Bytes, CodecError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(CodecError::InvalidLength(len));
        }
        let len = len as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }
}

/// Encoder/decoder pair for a protocol's message type.
///
/// Stateless codecs are shared across connections; a stateful codec is
/// instantiated per connection through its [`CodecFactory`].
pub trait Codec<T>: Send + Sync {
    /// Whether the codec keeps per-connection state.
    fn is_stateful(&self) -> bool {
        false
    }

    /// Encodes one message into a frame body.
    fn encode(&self, msg: &T, out: &mut DataWriter) -> Result<(), CodecError>;

    /// Decodes one message from a frame body.
    fn decode(&self, input: &mut DataReader) -> Result<T, CodecError>;
}

/// Produces codec instances for connections.
pub trait CodecFactory<T>: Send + Sync {
    /// Returns a codec for a new connection. Stateless codecs return a
    /// shared instance.
    fn create(&self) -> Arc<dyn Codec<T>>;
}

/// Factory that hands out one shared stateless codec instance.
pub struct SingletonCodecFactory<T, C> {
    codec: Arc<C>,
    _marker: PhantomData<fn(T)>,
}

impl<T, C: Codec<T>> SingletonCodecFactory<T, C> {
    /// Wraps a stateless codec.
    pub fn new(codec: C) -> Self {
        debug_assert!(!codec.is_stateful());
        Self {
            codec: Arc::new(codec),
            _marker: PhantomData,
        }
    }
}

impl<T, C> CodecFactory<T> for SingletonCodecFactory<T, C>
where
    C: Codec<T> + 'static,
    T: 'static,
{
    fn create(&self) -> Arc<dyn Codec<T>> {
        Arc::clone(&self.codec) as Arc<dyn Codec<T>>
    }
}

/// Encodes a message to payload bytes with the given codec.
pub fn encode_to_bytes<T>(codec: &dyn Codec<T>, msg: &T) -> Result<Bytes, CodecError> {
    let mut writer = DataWriter::new();
    codec.encode(msg, &mut writer)?;
    Ok(writer.into_bytes())
}

/// Decodes payload bytes with the given codec, rejecting trailing garbage.
pub fn decode_from_bytes<T>(codec: &dyn Codec<T>, bytes: Bytes) -> Result<T, CodecError> {
    let mut reader = DataReader::new(bytes);
    let msg = codec.decode(&mut reader)?;
    if reader.remaining() > 0 {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut w = DataWriter::new();
        w.write_u8(0xab);
        w.write_bool(true);
        w.write_i32(-42);
        w.write_u32(42);
        w.write_i64(i64::MIN);
        w.write_u64(u64::MAX);
        w.write_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        w.write_str("hekate");
        w.write_blob(&[1, 2, 3]);

        let mut r = DataReader::new(w.into_bytes());
        assert_eq!(r.read_u8().unwrap(), 0xab);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_u32().unwrap(), 42);
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(
            r.read_u128().unwrap(),
            0x0123_4567_89ab_cdef_0123_4567_89ab_cdef
        );
        assert_eq!(r.read_string().unwrap(), "hekate");
        assert_eq!(r.read_blob().unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_frame_reports_eof() {
        let mut w = DataWriter::new();
        w.write_u8(1);
        let mut r = DataReader::new(w.into_bytes());
        r.read_u8().unwrap();
        match r.read_i64() {
            Err(CodecError::Eof { wanted }) => assert_eq!(wanted, 8),
            other => panic!("expected eof, got {other:?}"),
        }
    }

    #[test]
    fn negative_length_rejected() {
        let mut w = DataWriter::new();
        w.write_i32(-5);
        let mut r = DataReader::new(w.into_bytes());
        assert!(matches!(
            r.read_string(),
            Err(CodecError::InvalidLength(-5))
        ));
    }

    #[test]
    fn empty_string_round_trip() {
        let mut w = DataWriter::new();
        w.write_str("");
        let mut r = DataReader::new(w.into_bytes());
        assert_eq!(r.read_string().unwrap(), "");
    }
}
