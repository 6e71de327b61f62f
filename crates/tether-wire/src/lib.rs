#![deny(unsafe_code)]

//! tether-wire: wire message model and framing for the tether RPC protocol.
//!
//! This crate defines:
//! - The [`Message`] tagged union (Request / Response / Cancel)
//! - The [`WireError`] structured remote-error value
//! - Length-prefixed framing over any async byte stream
//!   ([`FrameReader`], [`FrameWriter`], [`FramedStream`])
//! - The decode-failure taxonomy ([`ProtocolError`])
//!
//! # Frame format
//!
//! Every message is a self-contained frame:
//!
//! ```text
//! [4-byte little-endian payload length][JSON payload]
//! ```
//!
//! The payload is the JSON serialization of one [`Message`], discriminated
//! by a `kind` field so heterogeneous peers can decode it without schema
//! knowledge. Frames never interleave; a decoder either consumes a whole
//! frame or none of it.

mod error;
mod framing;
mod message;

pub use error::ProtocolError;
pub use framing::{FrameReader, FrameWriter, FramedStream, DEFAULT_MAX_FRAME_LEN};
pub use message::{Message, WireError};

// Re-export the opaque payload type used for args/results.
pub use serde_json::Value;
