//! Length-prefixed framing of Events over a byte stream.
//!
//! A worker and its supervisor share one duplex byte channel (the
//! worker's stdin/stdout). Each encoded [`Event`] travels as one frame:
//! a `u32` big-endian length followed by the envelope bytes. The outer
//! length lets a reader skip a malformed frame without losing sync.

use crate::error::DecodeError;
use crate::event::{Event, HEADER_LEN, MAX_DATA_SIZE};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body a reader will buffer.
pub const MAX_FRAME_SIZE: usize = HEADER_LEN + MAX_DATA_SIZE;

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum ReadFrame {
    /// A well-formed Event.
    Event(Event),
    /// A frame was consumed but could not be decoded; the stream is still
    /// positioned at the next frame boundary.
    Malformed(DecodeError),
    /// The peer closed the stream (possibly mid-frame).
    Closed,
}

/// Read the next frame.
///
/// # Errors
///
/// Returns an I/O error other than end-of-stream; end-of-stream is
/// reported as [`ReadFrame::Closed`].
pub async fn read_frame<R>(reader: &mut R) -> io::Result<ReadFrame>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadFrame::Closed),
        Err(e) => return Err(e),
    };

    if len > MAX_FRAME_SIZE {
        let wanted = len as u64;
        let skipped = tokio::io::copy(&mut (&mut *reader).take(wanted), &mut tokio::io::sink()).await?;
        if skipped < wanted {
            return Ok(ReadFrame::Closed);
        }
        return Ok(ReadFrame::Malformed(DecodeError::OversizedFrame(len)));
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadFrame::Closed),
        Err(e) => return Err(e),
    }

    Ok(match Event::decode(&body) {
        Ok(event) => ReadFrame::Event(event),
        Err(e) => ReadFrame::Malformed(e),
    })
}

/// Write one Event as a frame and flush.
///
/// # Errors
///
/// Returns any I/O error from the underlying writer.
pub async fn write_frame<W>(writer: &mut W, event: &Event) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = event.encode();
    // Bounded by MAX_FRAME_SIZE, which fits in u32.
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}
