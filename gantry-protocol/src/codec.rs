//! Stream framing: reads and writes whole frames over async byte streams.

use crate::buffer::Buffer;
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameFormat, FrameMeta};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length-prefixed frame codec.
///
/// The codec is stateless apart from its [`FrameFormat`]; the caller supplies
/// the scratch [`Buffer`] so each session loop can reuse its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    format: FrameFormat,
}

impl FrameCodec {
    pub fn new(format: FrameFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Reads the next frame from `reader`, assembling it in `buf`.
    ///
    /// Returns `Ok(None)` for a zero-length heartbeat frame. Length fields are
    /// validated before the rest of the frame is read, so an oversized frame
    /// is rejected without buffering its payload. Any error leaves the stream
    /// position undefined.
    pub async fn read<R>(&self, reader: &mut R, buf: &mut Buffer) -> Result<Option<Frame>, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let width = self.format.length_width.bytes();
        let order = self.format.byte_order;
        buf.clear();

        reader.read_exact(buf.claim(width)).await?;
        let total_len = buf.read_uint(width, order)?;
        if total_len == 0 {
            return Ok(None);
        }
        self.format.check_total(total_len)?;

        reader.read_exact(buf.claim(width)).await?;
        let header_len = buf.read_uint(width, order)?;
        self.format.check_header(total_len, header_len)?;

        let remaining = (total_len - self.format.meta_len()) as usize;
        reader.read_exact(buf.claim(remaining)).await?;
        tracing::trace!(total_len, header_len, "frame read");

        Frame::decode_parts(
            &self.format,
            FrameMeta {
                total_len,
                header_len,
            },
            buf,
        )
        .map(Some)
    }

    /// Encodes `frame` into `buf` and writes it fully to `writer`.
    ///
    /// Short writes are retried until the whole frame is out or the stream
    /// fails; the writer is flushed afterwards.
    pub async fn write<W>(&self, writer: &mut W, buf: &mut Buffer, frame: &Frame) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        buf.clear();
        let meta = frame.encode(&self.format, buf)?;
        writer.write_all(buf.as_slice()).await?;
        writer.flush().await?;
        tracing::trace!(total_len = meta.total_len, "frame written");
        Ok(())
    }
}
