//! Length-prefixed framing for TCP streams.
//!
//! Every message on the wire is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. A length of 0 is a
//! valid empty frame; reading zero bytes where a prefix was expected is an
//! orderly close, not an empty frame.
//!
//! Blocking helpers ([`read_frame`], [`write_frame`]) serve the client's
//! receive thread and senders. The `_async` twins serve tokio peers such as
//! the echo server. Both tolerate transports that move one byte at a time.

use std::io::{self, Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::packet::Packet;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Payload buffers grow by at most this much per read, so memory tracks the
/// bytes actually received rather than the declared length.
const PAYLOAD_CHUNK: usize = 64 * 1024;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    ///
    /// A complete frame is held in memory before dispatch, so this is also
    /// the per-connection memory ceiling for an untrusted peer.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: tether_config::DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream where a frame was expected.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream ended partway through a frame.
    #[error("frame truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    /// A write failed after `written` payload bytes were accepted.
    #[error("write failed after {written} payload bytes: {source}")]
    PartialWrite {
        written: usize,
        #[source]
        source: io::Error,
    },

    /// An I/O error occurred while reading.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Encode the length prefix for a payload of `len` bytes.
pub fn encode_length(
    len: usize,
    config: &FrameConfig,
) -> Result<[u8; LENGTH_PREFIX_LEN], FrameError> {
    match u32::try_from(len) {
        Ok(n) if n <= config.max_payload_size => Ok(n.to_le_bytes()),
        _ => Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        }),
    }
}

/// Decode and validate a length prefix.
pub fn decode_length(
    prefix: [u8; LENGTH_PREFIX_LEN],
    config: &FrameConfig,
) -> Result<usize, FrameError> {
    let len = u32::from_le_bytes(prefix);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len as usize,
            max: config.max_payload_size,
        });
    }
    Ok(len as usize)
}

/// Read until `buf` is full or the reader reports end of stream.
///
/// Returns the number of bytes read; less than `buf.len()` means the stream
/// ended early. `Interrupted` reads are retried.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write all of `buf`, reporting how much was accepted if a write fails.
///
/// A write that accepts zero bytes fails with [`io::ErrorKind::WriteZero`].
pub fn write_full<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> Result<(), FrameError> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(FrameError::PartialWrite {
                    written,
                    source: io::ErrorKind::WriteZero.into(),
                });
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(FrameError::PartialWrite { written, source }),
        }
    }
    Ok(())
}

/// Read a single frame from a blocking stream.
///
/// Zero bytes where the prefix or a non-empty payload was expected yield
/// [`FrameError::ConnectionClosed`]; a partial prefix or payload yields
/// [`FrameError::Truncated`] and the bytes are discarded.
pub fn read_frame<R: Read + ?Sized>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Packet, FrameError> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let n = read_full(reader, &mut prefix)?;
    check_complete(n, LENGTH_PREFIX_LEN)?;

    let len = decode_length(prefix, config)?;
    let mut data = Vec::with_capacity(len.min(PAYLOAD_CHUNK));
    while data.len() < len {
        let start = data.len();
        data.resize(len.min(start + PAYLOAD_CHUNK), 0);
        let n = read_full(reader, &mut data[start..])?;
        if start + n < data.len() {
            data.truncate(start + n);
            break;
        }
    }
    check_complete(data.len(), len)?;

    Ok(Packet::new(data))
}

/// Write a single frame to a blocking stream.
///
/// Returns the number of payload bytes written. On failure the error is
/// [`FrameError::PartialWrite`] carrying the payload bytes that made it out
/// (zero when the prefix itself could not be written).
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<usize, FrameError> {
    let prefix = encode_length(payload.len(), config)?;

    write_full(writer, &prefix).map_err(|e| match e {
        FrameError::PartialWrite { source, .. } => {
            FrameError::PartialWrite { written: 0, source }
        }
        other => other,
    })?;
    write_full(writer, payload)?;
    writer.flush().map_err(|source| FrameError::PartialWrite {
        written: payload.len(),
        source,
    })?;

    Ok(payload.len())
}

/// Read a single frame from an async stream. Same classification as [`read_frame`].
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Packet, FrameError> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let n = read_full_async(reader, &mut prefix).await?;
    check_complete(n, LENGTH_PREFIX_LEN)?;

    let len = decode_length(prefix, config)?;
    let mut data = Vec::with_capacity(len.min(PAYLOAD_CHUNK));
    while data.len() < len {
        let start = data.len();
        data.resize(len.min(start + PAYLOAD_CHUNK), 0);
        let n = read_full_async(reader, &mut data[start..]).await?;
        if start + n < data.len() {
            data.truncate(start + n);
            break;
        }
    }
    check_complete(data.len(), len)?;

    Ok(Packet::new(data))
}

/// Write a single frame to an async stream.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<usize, FrameError> {
    let prefix = encode_length(payload.len(), config)?;

    writer.write_all(&prefix).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(payload.len())
}

async fn read_full_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn check_complete(received: usize, expected: usize) -> Result<(), FrameError> {
    if received == expected {
        Ok(())
    } else if received == 0 {
        Err(FrameError::ConnectionClosed)
    } else {
        Err(FrameError::Truncated { expected, received })
    }
}
