//! Decode-failure taxonomy for the framing layer.

use std::io;

/// Error decoding or encoding a frame.
///
/// Any of these invalidates the owning connection: a byte stream cannot be
/// resynchronized mid-frame, so the connection layer treats every variant
/// as fatal to the stream.
#[derive(Debug)]
pub enum ProtocolError {
    /// The length header exceeds the configured frame ceiling.
    Oversize { len: usize, max: usize },
    /// The payload is not a valid serialized message.
    Malformed(serde_json::Error),
    /// The peer closed the stream in the middle of a frame.
    TruncatedFrame,
    /// Underlying stream failure.
    Io(io::Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Oversize { len, max } => {
                write!(f, "frame length {len} exceeds ceiling {max}")
            }
            ProtocolError::Malformed(e) => write!(f, "malformed frame payload: {e}"),
            ProtocolError::TruncatedFrame => write!(f, "stream closed mid-frame"),
            ProtocolError::Io(e) => write!(f, "stream error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Malformed(e) => Some(e),
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl ProtocolError {
    /// True for failures of the byte stream itself, as opposed to
    /// well-transported but undecodable bytes.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}
