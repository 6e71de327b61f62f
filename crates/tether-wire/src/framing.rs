//! Length-prefixed framing for async byte streams.
//!
//! Messages are prefixed by a 4-byte little-endian payload length. This
//! module is generic over the stream type - it works with any type that
//! implements `AsyncRead` / `AsyncWrite`, including:
//! - `TcpStream` (TCP sockets)
//! - `UnixStream` (Unix domain sockets)
//! - `tokio::io::DuplexStream` (in-process pairs, used by the tests)
//!
//! Decoding is a pure function of the byte stream: it suspends only on
//! short reads, never consumes a partial frame, and reports clean end of
//! stream exactly when the peer closes on a frame boundary. The length
//! header is validated against the frame ceiling before any payload is
//! buffered, so a hostile header can never cause an unbounded allocation.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

use crate::{Message, ProtocolError};

/// Default frame ceiling: 16 MiB of payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

/// Decoding half of a framed connection.
pub struct FrameReader<R> {
    stream: R,
    max_frame_len: usize,
}

impl<R> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self::with_limit(stream, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_limit(stream: R, max_frame_len: usize) -> Self {
        Self {
            stream,
            max_frame_len,
        }
    }
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` exactly when the peer closed the stream cleanly
    /// after a whole number of frames. EOF anywhere inside a frame is a
    /// [`ProtocolError::TruncatedFrame`].
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        let mut header = [0u8; LEN_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LEN_PREFIX_SIZE {
            let n = self.stream.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    trace!("clean end of stream");
                    return Ok(None);
                }
                return Err(ProtocolError::TruncatedFrame);
            }
            filled += n;
        }

        let len = u32::from_le_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(ProtocolError::Oversize {
                len,
                max: self.max_frame_len,
            });
        }

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ProtocolError::TruncatedFrame
            } else {
                ProtocolError::Io(e)
            }
        })?;

        let msg: Message = serde_json::from_slice(&payload).map_err(ProtocolError::Malformed)?;
        trace!(len, id = msg.id(), "frame in");
        Ok(Some(msg))
    }
}

/// Encoding half of a framed connection.
///
/// One `send` writes one whole frame and flushes it. Callers are
/// responsible for serializing access; frames from concurrent writers on
/// the same stream would interleave.
pub struct FrameWriter<W> {
    stream: W,
    encode_buf: Vec<u8>,
}

impl<W> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            encode_buf: Vec::with_capacity(1024),
        }
    }
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Send one message as one frame.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        self.encode_buf.clear();
        serde_json::to_writer(&mut self.encode_buf, msg).map_err(ProtocolError::Malformed)?;

        let len = u32::try_from(self.encode_buf.len()).map_err(|_| ProtocolError::Oversize {
            len: self.encode_buf.len(),
            max: u32::MAX as usize,
        })?;

        trace!(len, id = msg.id(), "frame out");
        self.stream.write_all(&len.to_le_bytes()).await?;
        self.stream.write_all(&self.encode_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// A framed connection owning both directions of one stream.
///
/// Convenient for scripted peers and tests; the connection runtime
/// prefers [`FramedStream::into_split`] so the read loop and the write
/// path can be owned separately.
pub struct FramedStream<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        Self::with_limit(stream, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_limit(stream: S, max_frame_len: usize) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: FrameReader::with_limit(r, max_frame_len),
            writer: FrameWriter::new(w),
        }
    }

    pub fn into_split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        self.writer.send(msg).await
    }

    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        self.reader.recv().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
