//! Growable binary buffer with independent read and write cursors.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! |   consumed bytes  |  readable bytes  |  writable space  |
//! +-------------------+------------------+------------------+
//! 0              read_pos          write_pos          capacity
//! ```
//!
//! Every wire value passes through here: fixed-width unsigned integers from
//! 8 to 64 bits in either byte order, IEEE-754 floats, LEB128 varints, UTF-8
//! text and raw byte ranges. Storage is a [`BytesMut`] whose length is the
//! write cursor; writes grow it by doubling. Reads past the write cursor fail
//! with [`ProtocolError::Underflow`].
//!
//! A buffer is owned by one task at a time and is not synchronized.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Smallest allocation made when an empty buffer first grows.
const MIN_GROW: usize = 64;

/// Longest LEB128 encoding of a 64-bit value.
pub const MAX_VARINT_LEN: usize = 10;

/// Byte order used for multi-byte integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Network byte order.
    #[default]
    Big,
    Little,
}

/// Binary read/write buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: BytesMut,
    read_pos: usize,
}

macro_rules! fixed_width {
    ($(($width:expr, $ty:ty, $write_le:ident, $write_be:ident, $read_le:ident, $read_be:ident)),* $(,)?) => {
        $(
            #[doc = concat!("Writes a ", stringify!($width), "-byte little-endian unsigned integer.")]
            pub fn $write_le(&mut self, value: $ty) {
                self.put(value as u64, $width, ByteOrder::Little);
            }

            #[doc = concat!("Writes a ", stringify!($width), "-byte big-endian unsigned integer.")]
            pub fn $write_be(&mut self, value: $ty) {
                self.put(value as u64, $width, ByteOrder::Big);
            }

            #[doc = concat!("Reads a ", stringify!($width), "-byte little-endian unsigned integer.")]
            pub fn $read_le(&mut self) -> Result<$ty, ProtocolError> {
                Ok(self.get($width, ByteOrder::Little)? as $ty)
            }

            #[doc = concat!("Reads a ", stringify!($width), "-byte big-endian unsigned integer.")]
            pub fn $read_be(&mut self) -> Result<$ty, ProtocolError> {
                Ok(self.get($width, ByteOrder::Big)? as $ty)
            }
        )*
    };
}

impl Buffer {
    /// Creates an empty buffer without allocating.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with `capacity` bytes preallocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Wraps existing bytes; all of them are readable.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&data[..]),
            read_pos: 0,
        }
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.data.len()
    }

    /// Returns the readable region without consuming it.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// Returns everything written so far, including consumed bytes.
    pub fn written(&self) -> &[u8] {
        &self.data[..]
    }

    /// Repositions both cursors within the current storage.
    ///
    /// Never allocates: a `write_pos` beyond [`capacity`](Self::capacity) is
    /// rejected like crossed cursors. Bytes exposed past the last write read
    /// as zero.
    pub fn reset(&mut self, read_pos: usize, write_pos: usize) -> Result<(), ProtocolError> {
        if read_pos > write_pos || write_pos > self.data.capacity() {
            return Err(ProtocolError::InvalidCursor {
                read: read_pos,
                write: write_pos,
            });
        }
        self.data.resize(write_pos, 0);
        self.read_pos = read_pos;
        Ok(())
    }

    /// Rewinds both cursors to zero.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// Skips `n` readable bytes.
    pub fn advance(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.take(n).map(|_| ())
    }

    /// Reserves `n` bytes past the write cursor and returns them for filling.
    ///
    /// The write cursor moves past the claimed region immediately.
    pub fn claim(&mut self, n: usize) -> &mut [u8] {
        self.ensure_writable(n);
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    // =========================================================================
    // Fixed-width integers
    // =========================================================================

    pub fn write_u8(&mut self, value: u8) {
        self.ensure_writable(1);
        self.data.put_u8(value);
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fixed_width!(
        (2, u16, write_u16_le, write_u16_be, read_u16_le, read_u16_be),
        (3, u32, write_u24_le, write_u24_be, read_u24_le, read_u24_be),
        (4, u32, write_u32_le, write_u32_be, read_u32_le, read_u32_be),
        (5, u64, write_u40_le, write_u40_be, read_u40_le, read_u40_be),
        (6, u64, write_u48_le, write_u48_be, read_u48_le, read_u48_be),
        (7, u64, write_u56_le, write_u56_be, read_u56_le, read_u56_be),
        (8, u64, write_u64_le, write_u64_be, read_u64_le, read_u64_be),
    );

    /// Writes the low `width` bytes of `value` in the given byte order.
    ///
    /// Bits above `width * 8` are dropped; callers check range first.
    pub fn write_uint(
        &mut self,
        value: u64,
        width: usize,
        order: ByteOrder,
    ) -> Result<(), ProtocolError> {
        if width == 0 || width > 8 {
            return Err(ProtocolError::UnsupportedWidth(width));
        }
        self.put(value, width, order);
        Ok(())
    }

    /// Reads a `width`-byte unsigned integer in the given byte order.
    pub fn read_uint(&mut self, width: usize, order: ByteOrder) -> Result<u64, ProtocolError> {
        if width == 0 || width > 8 {
            return Err(ProtocolError::UnsupportedWidth(width));
        }
        self.get(width, order)
    }

    // =========================================================================
    // Floats
    // =========================================================================

    pub fn write_f32_le(&mut self, value: f32) {
        self.write_u32_le(value.to_bits());
    }

    pub fn write_f32_be(&mut self, value: f32) {
        self.write_u32_be(value.to_bits());
    }

    pub fn write_f64_le(&mut self, value: f64) {
        self.write_u64_le(value.to_bits());
    }

    pub fn write_f64_be(&mut self, value: f64) {
        self.write_u64_be(value.to_bits());
    }

    pub fn read_f32_le(&mut self) -> Result<f32, ProtocolError> {
        self.read_u32_le().map(f32::from_bits)
    }

    pub fn read_f32_be(&mut self) -> Result<f32, ProtocolError> {
        self.read_u32_be().map(f32::from_bits)
    }

    pub fn read_f64_le(&mut self) -> Result<f64, ProtocolError> {
        self.read_u64_le().map(f64::from_bits)
    }

    pub fn read_f64_be(&mut self) -> Result<f64, ProtocolError> {
        self.read_u64_be().map(f64::from_bits)
    }

    // =========================================================================
    // Varints
    // =========================================================================

    /// Writes an unsigned LEB128 varint and returns the encoded length.
    pub fn write_uvarint(&mut self, mut value: u64) -> usize {
        let mut written = 1;
        while value >= 0x80 {
            self.write_u8((value as u8) | 0x80);
            value >>= 7;
            written += 1;
        }
        self.write_u8(value as u8);
        written
    }

    /// Writes a zig-zag encoded signed varint and returns the encoded length.
    pub fn write_varint(&mut self, value: i64) -> usize {
        self.write_uvarint(((value << 1) ^ (value >> 63)) as u64)
    }

    /// Reads an unsigned LEB128 varint.
    ///
    /// The read cursor does not move when the encoding is incomplete.
    pub fn read_uvarint(&mut self) -> Result<u64, ProtocolError> {
        let (value, len) = decode_uvarint(self.as_slice())?;
        self.read_pos += len;
        Ok(value)
    }

    /// Reads a zig-zag encoded signed varint.
    pub fn read_varint(&mut self) -> Result<i64, ProtocolError> {
        let raw = self.read_uvarint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    // =========================================================================
    // Text and raw bytes
    // =========================================================================

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data.put_slice(bytes);
    }

    /// Consumes `n` bytes and returns them borrowed from the buffer.
    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        self.take(n)
    }

    /// Consumes `n` bytes and hands them out without copying.
    ///
    /// The returned [`Bytes`] shares the buffer's allocation. Everything up to
    /// and including the split leaves the buffer, so both cursors restart at
    /// the first byte not yet read.
    pub fn split_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.check_readable(n)?;
        let consumed = self.read_pos;
        let chunk = self.data.split_to(consumed + n).freeze().slice(consumed..);
        self.read_pos = 0;
        Ok(chunk)
    }

    pub fn write_str(&mut self, text: &str) {
        self.write_bytes(text.as_bytes());
    }

    /// Consumes `n` bytes and decodes them as UTF-8.
    pub fn read_string(&mut self, n: usize) -> Result<String, ProtocolError> {
        self.check_readable(n)?;
        let start = self.read_pos;
        let text = std::str::from_utf8(&self.data[start..start + n])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        self.read_pos += n;
        Ok(text)
    }

    /// Writes one code point as UTF-8 and returns its width in bytes.
    pub fn write_char(&mut self, c: char) -> usize {
        let mut scratch = [0u8; 4];
        let encoded = c.encode_utf8(&mut scratch);
        self.write_bytes(encoded.as_bytes());
        encoded.len()
    }

    /// Decodes one UTF-8 code point, returning it with its width in bytes.
    pub fn read_char(&mut self) -> Result<(char, usize), ProtocolError> {
        let src = self.as_slice();
        let first = *src.first().ok_or(ProtocolError::Underflow {
            needed: 1,
            remaining: 0,
        })?;
        let width = match first {
            0x00..=0x7F => 1,
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return Err(ProtocolError::InvalidUtf8),
        };
        if src.len() < width {
            return Err(ProtocolError::Underflow {
                needed: width,
                remaining: src.len(),
            });
        }
        let c = std::str::from_utf8(&src[..width])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .chars()
            .next()
            .ok_or(ProtocolError::InvalidUtf8)?;
        self.read_pos += width;
        Ok((c, width))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_writable(&mut self, n: usize) {
        let len = self.data.len();
        let needed = len + n;
        if needed <= self.data.capacity() {
            return;
        }
        let mut capacity = self.data.capacity().max(MIN_GROW);
        while capacity < needed {
            capacity *= 2;
        }
        self.data.reserve(capacity - len);
    }

    fn check_readable(&self, n: usize) -> Result<(), ProtocolError> {
        let remaining = self.len();
        if n > remaining {
            return Err(ProtocolError::Underflow {
                needed: n,
                remaining,
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        self.check_readable(n)?;
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.data[start..self.read_pos])
    }

    fn put(&mut self, value: u64, width: usize, order: ByteOrder) {
        self.ensure_writable(width);
        match order {
            ByteOrder::Big => self.data.put_uint(value, width),
            ByteOrder::Little => self.data.put_uint_le(value, width),
        }
    }

    fn get(&mut self, width: usize, order: ByteOrder) -> Result<u64, ProtocolError> {
        let mut src = self.take(width)?;
        Ok(match order {
            ByteOrder::Big => src.get_uint(width),
            ByteOrder::Little => src.get_uint_le(width),
        })
    }
}

/// Decodes a LEB128 varint from the front of `src`, returning value and length.
fn decode_uvarint(src: &[u8]) -> Result<(u64, usize), ProtocolError> {
    let mut value = 0u64;
    let mut shift = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        // the tenth byte carries only the top bit of a u64
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(ProtocolError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte < 0x80 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    if src.len() >= MAX_VARINT_LEN {
        Err(ProtocolError::VarintOverflow)
    } else {
        Err(ProtocolError::Underflow {
            needed: src.len() + 1,
            remaining: src.len(),
        })
    }
}
