//! Framed wire buffer (component A).
//!
//! All worker-facing messages are framed as `[4-byte big-endian
//! length][payload]`. `FrameBuffer` appends length-prefixed messages into an
//! owned, geometrically-growing byte buffer; `FrameReader` walks a read-only
//! byte slice pulling frames back out. The payload codec is injected via the
//! `Encode`/`Decode` traits so this module stays agnostic of what's actually
//! being shipped over the wire.

use crate::error::{Error, Result};

/// Default initial capacity for a freshly constructed `FrameBuffer`.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Protobuf-style payloads are most efficient below this size; buffers grow
/// geometrically up to here before growth becomes additive.
pub const DESIRED_LIMIT: usize = 2 * 1024 * 1024;

/// Hard ceiling on a single frame. Exceeding it is always an error.
pub const HARD_LIMIT: usize = 64 * 1024 * 1024;

/// Size in bytes of the length header every frame is prefixed with.
pub const LENGTH_HEADER_SIZE: usize = 4;

/// A payload type that knows its own encoded size and can write itself
/// into a fixed-size slice. Mirrors the `ByteSize`/`SerializeToArray` pair
/// on the protobuf message types the original wire format was built around.
pub trait Encode {
    fn encoded_len(&self) -> usize;
    fn encode_into(&self, buf: &mut [u8]) -> Result<()>;
}

/// The corresponding decode half, implemented by whatever concrete response
/// type a caller expects to find at the front of the buffer.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<Self>;
}

impl Encode for Vec<u8> {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        buf[..self.len()].copy_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<Self> {
        Ok(buf.to_vec())
    }
}

/// An append-only, owned byte buffer used to serialize length-prefixed
/// messages before handing them to a transport.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    hard_limit: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            hard_limit: HARD_LIMIT,
        }
    }

    /// Meaningful size of the buffer (bytes written so far).
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Grows `self.data`'s backing storage geometrically (doubling) until it
    /// can hold `needed` bytes, without exceeding `hard_limit`. Existing
    /// contents are always preserved by `Vec::reserve`.
    fn extend(&mut self, needed: usize) -> Result<()> {
        if needed > self.hard_limit {
            return Err(Error::FrameTooLarge(format!(
                "need {} bytes, hard limit is {} bytes",
                needed, self.hard_limit
            )));
        }
        if needed > self.data.capacity() {
            let mut new_cap = self.data.capacity().max(DEFAULT_CAPACITY);
            while new_cap < needed {
                new_cap = (new_cap * 2).min(self.hard_limit);
                if new_cap == self.data.capacity() {
                    // Doubling stalled at the hard limit without reaching `needed`.
                    return Err(Error::FrameTooLarge(format!(
                        "cannot grow past hard limit {} bytes",
                        self.hard_limit
                    )));
                }
            }
            self.data.reserve(new_cap - self.data.len());
        }
        Ok(())
    }

    /// Append a length-prefixed message: a 4-byte big-endian header
    /// carrying the payload length, followed by the encoded payload.
    pub fn serialize<T: Encode>(&mut self, msg: &T) -> Result<()> {
        let payload_len = msg.encoded_len();
        let needed = self.data.len() + LENGTH_HEADER_SIZE + payload_len;
        self.extend(needed)?;

        self.data.extend_from_slice(&(payload_len as u32).to_be_bytes());

        let start = self.data.len();
        self.data.resize(start + payload_len, 0);
        msg.encode_into(&mut self.data[start..])?;
        Ok(())
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A read-only cursor over a byte slice, parsing one frame at a time.
pub struct FrameReader<'a> {
    data: &'a [u8],
    next: usize,
    end: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: 0,
            end: data.len(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.end - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads and advances past the 4-byte big-endian length header.
    pub fn parse_length(&mut self) -> Result<u32> {
        if self.remaining() < LENGTH_HEADER_SIZE {
            return Err(Error::FrameCorrupt(format!(
                "{} bytes remaining, need {} for the length header",
                self.remaining(),
                LENGTH_HEADER_SIZE
            )));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[self.next..self.next + LENGTH_HEADER_SIZE]);
        self.next += LENGTH_HEADER_SIZE;
        Ok(u32::from_be_bytes(raw))
    }

    /// Reads a length header, then exactly that many bytes, decoding them
    /// with `T::decode_from`.
    pub fn parse<T: Decode>(&mut self) -> Result<T> {
        let length = self.parse_length()? as usize;
        if self.remaining() < length {
            return Err(Error::FrameCorrupt(format!(
                "not enough data ({} bytes instead of {} to be interpreted as the message)",
                self.remaining(),
                length
            )));
        }
        let msg = T::decode_from(&self.data[self.next..self.next + length])?;
        self.next += length;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_message() {
        let mut buf = FrameBuffer::new();
        let payload = b"select * from Object".to_vec();
        buf.serialize(&payload).unwrap();

        let mut reader = FrameReader::new(buf.as_bytes());
        let decoded: Vec<u8> = reader.parse().unwrap();
        assert_eq!(decoded, payload);
        assert!(reader.is_empty());
    }

    #[test]
    fn multiple_frames_parse_in_order() {
        let mut buf = FrameBuffer::new();
        buf.serialize(&b"first".to_vec()).unwrap();
        buf.serialize(&b"second".to_vec()).unwrap();

        let mut reader = FrameReader::new(buf.as_bytes());
        let a: Vec<u8> = reader.parse().unwrap();
        let b: Vec<u8> = reader.parse().unwrap();
        assert_eq!(a, b"first");
        assert_eq!(b, b"second");
    }

    #[test]
    fn length_exactly_equal_to_remaining_bytes_succeeds() {
        let mut buf = FrameBuffer::new();
        buf.serialize(&b"exact".to_vec()).unwrap();

        let mut reader = FrameReader::new(buf.as_bytes());
        let decoded: Vec<u8> = reader.parse().unwrap();
        assert_eq!(decoded, b"exact");
    }

    #[test]
    fn length_one_larger_than_remaining_fails() {
        let mut buf = FrameBuffer::new();
        buf.serialize(&b"short".to_vec()).unwrap();
        let mut bytes = buf.as_bytes().to_vec();
        // Bump the declared length by one without adding the extra byte.
        let declared = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        bytes[0..4].copy_from_slice(&(declared + 1).to_be_bytes());

        let mut reader = FrameReader::new(&bytes);
        let result: Result<Vec<u8>> = reader.parse();
        assert!(matches!(result, Err(Error::FrameCorrupt(_))));
    }

    #[test]
    fn too_few_bytes_for_header_fails() {
        let mut reader = FrameReader::new(&[0u8, 1, 2]);
        assert!(reader.parse_length().is_err());
    }

    #[test]
    fn exceeding_hard_limit_fails() {
        let mut buf = FrameBuffer::with_capacity(16);
        buf.hard_limit = 32;
        let payload = vec![0u8; 64];
        let result = buf.serialize(&payload);
        assert!(matches!(result, Err(Error::FrameTooLarge(_))));
    }

    #[test]
    fn growth_preserves_existing_contents() {
        let mut buf = FrameBuffer::with_capacity(8);
        buf.serialize(&b"abc".to_vec()).unwrap();
        let before = buf.as_bytes().to_vec();
        buf.serialize(&vec![1u8; 4096]).unwrap();
        assert_eq!(&buf.as_bytes()[..before.len()], &before[..]);
    }
}
