//! # gantry-protocol
//!
//! Wire layer for gantry.
//!
//! This crate provides:
//! - A growable byte buffer with fixed-width, varint, float and text codecs
//! - Length-prefixed framing with configurable field width and byte order
//! - An async frame codec over `AsyncRead`/`AsyncWrite` streams
//! - Marshal hooks converting application messages to frames

pub mod buffer;
pub mod codec;
pub mod error;
pub mod frame;
pub mod marshal;

pub use buffer::{Buffer, ByteOrder, MAX_VARINT_LEN};
pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{
    Frame, FrameFormat, FrameHeader, FrameMeta, LengthWidth, DEFAULT_MAX_FRAME_SIZE,
    MIN_HEADER_LEN,
};
pub use marshal::{FnMarshal, JsonMarshal, Marshal, RawMarshal};

/// Default port for a gantry server.
pub const DEFAULT_PORT: u16 = 7410;

/// Operation code reserved for ping/pong exchanges.
pub const OP_PING: u16 = 0;
