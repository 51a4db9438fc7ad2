//! Length-prefixed frame format.
//!
//! Frame layout (N = configured length field width, 1/2/4/8 bytes):
//!
//! ```text
//! +--------------+--------------+----------+-----------+---------+
//! | total_len    | header_len   | sequence | operation | version |
//! | N bytes      | N bytes      | 4 bytes  | 2 bytes   | 2 bytes |
//! +--------------+--------------+----------+-----------+---------+
//! | extra (header_len - 8 bytes) | body (total_len - 2N - header_len)|
//! +------------------------------+-----------------------------------+
//! ```
//!
//! `total_len` counts every byte of the frame including both length fields.
//! All multi-byte fields use the configured byte order.

use crate::buffer::{Buffer, ByteOrder};
use crate::error::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Size of the fixed header fields (sequence + operation + version).
pub const MIN_HEADER_LEN: u64 = 8;

/// Default maximum frame size (32 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 32 * 1024;

/// Width of the two length fields at the front of every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LengthWidth {
    One,
    Two,
    #[default]
    Four,
    Eight,
}

impl LengthWidth {
    /// Number of bytes in one length field.
    pub fn bytes(self) -> usize {
        match self {
            LengthWidth::One => 1,
            LengthWidth::Two => 2,
            LengthWidth::Four => 4,
            LengthWidth::Eight => 8,
        }
    }

    /// Largest length expressible in a field of this width.
    pub fn max_value(self) -> u64 {
        match self {
            LengthWidth::Eight => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }
}

impl TryFrom<u8> for LengthWidth {
    type Error = ProtocolError;

    fn try_from(bytes: u8) -> Result<Self, Self::Error> {
        match bytes {
            1 => Ok(LengthWidth::One),
            2 => Ok(LengthWidth::Two),
            4 => Ok(LengthWidth::Four),
            8 => Ok(LengthWidth::Eight),
            other => Err(ProtocolError::UnsupportedWidth(other as usize)),
        }
    }
}

impl From<LengthWidth> for u8 {
    fn from(width: LengthWidth) -> Self {
        width.bytes() as u8
    }
}

/// Wire format parameters. Both ends of a connection must agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub length_width: LengthWidth,
    pub byte_order: ByteOrder,
    pub max_frame_size: u64,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            length_width: LengthWidth::Four,
            byte_order: ByteOrder::Big,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl FrameFormat {
    pub fn new(length_width: LengthWidth, byte_order: ByteOrder) -> Self {
        Self {
            length_width,
            byte_order,
            ..Default::default()
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u64) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Size of the two length fields together.
    pub fn meta_len(&self) -> u64 {
        2 * self.length_width.bytes() as u64
    }

    /// Checks a declared total length against the size limits.
    pub fn check_total(&self, total_len: u64) -> Result<(), ProtocolError> {
        if total_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total_len,
                max: self.max_frame_size,
            });
        }
        if total_len < self.meta_len() {
            return Err(ProtocolError::FrameTooSmall {
                size: total_len,
                min: self.meta_len(),
            });
        }
        Ok(())
    }

    /// Checks a declared header length against its frame's total length.
    pub fn check_header(&self, total_len: u64, header_len: u64) -> Result<(), ProtocolError> {
        let max = total_len - self.meta_len();
        if header_len > max {
            return Err(ProtocolError::HeaderTooLarge {
                size: header_len,
                max,
            });
        }
        if header_len < MIN_HEADER_LEN {
            return Err(ProtocolError::HeaderTooSmall {
                size: header_len,
                min: MIN_HEADER_LEN,
            });
        }
        Ok(())
    }
}

/// The two length fields of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub total_len: u64,
    pub header_len: u64,
}

/// Header fields of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Correlation token (the opaque ID for request/response exchanges).
    pub sequence: u32,
    pub operation: u16,
    pub version: u16,
    /// Application-defined header extension.
    pub extra: Bytes,
}

impl FrameHeader {
    /// Encoded header size.
    pub fn encoded_len(&self) -> u64 {
        MIN_HEADER_LEN + self.extra.len() as u64
    }
}

/// A decoded frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    /// Creates a frame for `operation` carrying `body`.
    pub fn new(operation: u16, body: impl Into<Bytes>) -> Self {
        Self {
            header: FrameHeader {
                operation,
                ..Default::default()
            },
            body: body.into(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.header.sequence = sequence;
        self
    }

    pub fn with_version(mut self, version: u16) -> Self {
        self.header.version = version;
        self
    }

    pub fn with_extra(mut self, extra: impl Into<Bytes>) -> Self {
        self.header.extra = extra.into();
        self
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn operation(&self) -> u16 {
        self.header.operation
    }

    /// Computes the length fields this frame encodes with.
    pub fn meta(&self, format: &FrameFormat) -> FrameMeta {
        let header_len = self.header.encoded_len();
        FrameMeta {
            total_len: format.meta_len() + header_len + self.body.len() as u64,
            header_len,
        }
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode(&self, format: &FrameFormat, buf: &mut Buffer) -> Result<FrameMeta, ProtocolError> {
        let meta = self.meta(format);
        if meta.total_len > format.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: meta.total_len,
                max: format.max_frame_size,
            });
        }
        let width = format.length_width.bytes();
        if meta.total_len > format.length_width.max_value() {
            return Err(ProtocolError::LengthOverflow {
                value: meta.total_len,
                width,
            });
        }

        let order = format.byte_order;
        buf.write_uint(meta.total_len, width, order)?;
        buf.write_uint(meta.header_len, width, order)?;
        buf.write_uint(self.header.sequence as u64, 4, order)?;
        buf.write_uint(self.header.operation as u64, 2, order)?;
        buf.write_uint(self.header.version as u64, 2, order)?;
        buf.write_bytes(&self.header.extra);
        buf.write_bytes(&self.body);

        Ok(meta)
    }

    /// Decodes one complete frame from the front of `buf`.
    pub fn decode(format: &FrameFormat, buf: &mut Buffer) -> Result<Self, ProtocolError> {
        let width = format.length_width.bytes();
        let total_len = buf.read_uint(width, format.byte_order)?;
        format.check_total(total_len)?;
        let header_len = buf.read_uint(width, format.byte_order)?;
        format.check_header(total_len, header_len)?;
        Self::decode_parts(format, FrameMeta { total_len, header_len }, buf)
    }

    /// Decodes header and body once both length fields are validated.
    pub(crate) fn decode_parts(
        format: &FrameFormat,
        meta: FrameMeta,
        buf: &mut Buffer,
    ) -> Result<Self, ProtocolError> {
        let order = format.byte_order;
        let sequence = buf.read_uint(4, order)? as u32;
        let operation = buf.read_uint(2, order)? as u16;
        let version = buf.read_uint(2, order)? as u16;

        let extra_len = (meta.header_len - MIN_HEADER_LEN) as usize;
        let extra = buf.split_bytes(extra_len)?;

        let body_len = (meta.total_len - format.meta_len() - meta.header_len) as usize;
        let body = buf.split_bytes(body_len)?;

        Ok(Self {
            header: FrameHeader {
                sequence,
                operation,
                version,
                extra,
            },
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::new(1, Bytes::from_static(b"body"))
            .with_sequence(1)
            .with_version(0)
            .with_extra(Bytes::from_static(b"header extra"))
    }

    #[test]
    fn test_frame_integrity() {
        let format = FrameFormat::default();
        let frame = sample();

        let mut buf = Buffer::new();
        let meta = frame.encode(&format, &mut buf).unwrap();
        assert_eq!(meta.header_len, 8 + 12);
        assert_eq!(meta.total_len, format.meta_len() + meta.header_len + 4);
        assert_eq!(buf.len() as u64, meta.total_len);

        let decoded = Frame::decode(&format, &mut buf).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.meta(&format), meta);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_big_endian_layout() {
        let format = FrameFormat::default();
        let frame = Frame::new(0x0102, Bytes::from_static(b"x"))
            .with_sequence(0x0A0B0C0D)
            .with_version(3);

        let mut buf = Buffer::new();
        frame.encode(&format, &mut buf).unwrap();
        assert_eq!(
            buf.as_slice(),
            &[
                0, 0, 0, 17, // total_len
                0, 0, 0, 8, // header_len
                0x0A, 0x0B, 0x0C, 0x0D, // sequence
                0x01, 0x02, // operation
                0, 3, // version
                b'x',
            ]
        );
    }

    #[test]
    fn test_little_endian_two_byte_lengths() {
        let format = FrameFormat::new(LengthWidth::Two, ByteOrder::Little);
        let frame = sample();

        let mut buf = Buffer::new();
        let meta = frame.encode(&format, &mut buf).unwrap();
        assert_eq!(&buf.as_slice()[..2], &(meta.total_len as u16).to_le_bytes());

        let decoded = Frame::decode(&format, &mut buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_empty_extra_and_body() {
        let format = FrameFormat::new(LengthWidth::One, ByteOrder::Big);
        let frame = Frame::new(9, Bytes::new()).with_sequence(42);

        let mut buf = Buffer::new();
        let meta = frame.encode(&format, &mut buf).unwrap();
        assert_eq!(meta.total_len, 2 + 8);

        let decoded = Frame::decode(&format, &mut buf).unwrap();
        assert!(decoded.header.extra.is_empty());
        assert!(decoded.body.is_empty());
        assert_eq!(decoded.sequence(), 42);
        assert_eq!(decoded.operation(), 9);
    }

    #[test]
    fn test_encode_too_large() {
        let format = FrameFormat::default().with_max_frame_size(32);
        let frame = Frame::new(1, vec![0u8; 64]);

        let mut buf = Buffer::new();
        let result = frame.encode(&format, &mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size: 80, max: 32 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_length_overflow() {
        let format = FrameFormat::new(LengthWidth::One, ByteOrder::Big);
        let frame = Frame::new(1, vec![0u8; 300]);

        let mut buf = Buffer::new();
        let result = frame.encode(&format, &mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::LengthOverflow { width: 1, .. })
        ));
    }

    #[test]
    fn test_decode_header_too_small() {
        let format = FrameFormat::default();
        let mut buf = Buffer::new();
        buf.write_u32_be(20);
        buf.write_u32_be(4);
        buf.write_bytes(&[0u8; 12]);

        let result = Frame::decode(&format, &mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::HeaderTooSmall { size: 4, min: 8 })
        ));
    }

    #[test]
    fn test_decode_header_too_large() {
        let format = FrameFormat::default();
        let mut buf = Buffer::new();
        buf.write_u32_be(20);
        buf.write_u32_be(13);
        buf.write_bytes(&[0u8; 12]);

        let result = Frame::decode(&format, &mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::HeaderTooLarge { size: 13, max: 12 })
        ));
    }

    #[test]
    fn test_decode_truncated_body() {
        let format = FrameFormat::default();
        let mut buf = Buffer::new();
        sample().encode(&format, &mut buf).unwrap();
        let truncated = buf.as_slice()[..buf.len() - 1].to_vec();

        let result = Frame::decode(&format, &mut Buffer::from_vec(truncated));
        assert!(matches!(result, Err(ProtocolError::Underflow { .. })));
    }

    #[test]
    fn test_length_width_conversions() {
        assert_eq!(LengthWidth::try_from(2).unwrap(), LengthWidth::Two);
        assert!(matches!(
            LengthWidth::try_from(3),
            Err(ProtocolError::UnsupportedWidth(3))
        ));
        assert_eq!(u8::from(LengthWidth::Eight), 8);
        assert_eq!(LengthWidth::Two.max_value(), u16::MAX as u64);
        assert_eq!(LengthWidth::Eight.max_value(), u64::MAX);
    }

    #[test]
    fn test_check_total() {
        let format = FrameFormat::default();
        assert!(format.check_total(16).is_ok());
        assert!(matches!(
            format.check_total(7),
            Err(ProtocolError::FrameTooSmall { size: 7, min: 8 })
        ));
        assert!(matches!(
            format.check_total(DEFAULT_MAX_FRAME_SIZE + 1),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
