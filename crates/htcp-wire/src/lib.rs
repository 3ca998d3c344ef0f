//! Length-prefixed binary frame codec.
//!
//! A frame on the wire is: 1-byte `kind`, 8-byte big-endian `correlation_id`,
//! 4-byte big-endian `payload_length`, then exactly that many payload bytes.
//! The codec is stateless and does not interpret payload bytes; it only
//! knows how to split a byte stream into frames and back.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed frame header: 1 (kind) + 8 (correlation id) + 4 (length).
const HEADER_LEN: usize = 1 + 8 + 4;

/// Default cap on a single frame's payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// The kind of a frame, carried as the first byte on the wire.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Hello = 0,
    Welcome = 1,
    Call = 2,
    Reply = 3,
    Error = 4,
    Subscribe = 5,
    Item = 6,
    End = 7,
    Cancel = 8,
    InfoReq = 9,
    InfoRep = 10,
}

impl Kind {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Kind::Hello,
            1 => Kind::Welcome,
            2 => Kind::Call,
            3 => Kind::Reply,
            4 => Kind::Error,
            5 => Kind::Subscribe,
            6 => Kind::Item,
            7 => Kind::End,
            8 => Kind::Cancel,
            9 => Kind::InfoReq,
            10 => Kind::InfoRep,
            _ => return None,
        })
    }
}

/// A single framed message: kind, correlation id, and raw encoded payload.
///
/// `payload` holds the bytes produced by the value codec; this crate never
/// looks inside them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: Kind,
    pub correlation_id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: Kind, correlation_id: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            correlation_id,
            payload,
        }
    }
}

/// Error produced while reading or writing a frame.
#[derive(Debug)]
pub enum FrameError {
    /// The stream closed cleanly with no bytes pending (EOF before a frame started).
    Eof,
    /// The stream ended partway through a frame header or payload.
    Truncated,
    /// The first byte did not match any known [`Kind`].
    UnknownKind(u8),
    /// The declared payload length exceeded the configured maximum.
    PayloadTooLarge { len: u32, max: u32 },
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Eof => write!(f, "connection closed before a frame was sent"),
            FrameError::Truncated => write!(f, "connection closed mid-frame"),
            FrameError::UnknownKind(b) => write!(f, "unknown frame kind byte {b}"),
            FrameError::PayloadTooLarge { len, max } => {
                write!(f, "frame payload of {len} bytes exceeds the {max} byte limit")
            }
            FrameError::Io(e) => write!(f, "frame I/O error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Write a frame to `writer`, flushing once the whole frame is on the wire.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let mut header = [0u8; HEADER_LEN];
    let mut cursor = Cursor::new(&mut header[..]);
    cursor.write_u8(frame.kind as u8)?;
    cursor.write_u64::<BigEndian>(frame.correlation_id)?;
    cursor.write_u32::<BigEndian>(frame.payload.len() as u32)?;

    writer.write_all(&header).await?;
    if !frame.payload.is_empty() {
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;
    tracing::trace!(kind = ?frame.kind, corr = frame.correlation_id, len = frame.payload.len(), "wrote frame");
    Ok(())
}

/// Read one frame from `reader`, rejecting payloads longer than `max_payload_len`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload_len: u32,
) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Eof);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let mut cursor = Cursor::new(&header[..]);
    let kind_byte = cursor.read_u8()?;
    let kind = Kind::from_u8(kind_byte).ok_or(FrameError::UnknownKind(kind_byte))?;
    let correlation_id = cursor.read_u64::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;

    if payload_len > max_payload_len {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            max: max_payload_len,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
                _ => FrameError::Io(e),
            })?;
    }

    tracing::trace!(kind = ?kind, corr = correlation_id, len = payload.len(), "read frame");
    Ok(Frame {
        kind,
        correlation_id,
        payload,
    })
}
