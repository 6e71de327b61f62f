//! Caller-visible error taxonomy.

use std::io;

use tether_wire::WireError;

/// Error from making an outgoing call.
///
/// Every failed call ends in exactly one of these kinds, so call sites
/// can pattern-match to decide whether to redial, re-invoke, or give up.
/// The runtime never retries on the caller's behalf.
#[derive(Debug)]
pub enum CallError {
    /// Malformed traffic on the connection. Fatal to the connection.
    Protocol(String),
    /// The transport failed or the connection was closed. Every call
    /// pending at that moment gets this; the registry evicts the entry
    /// so the next call redials.
    ConnectionFault(String),
    /// The call's deadline elapsed before a Response arrived. Local to
    /// this call; the connection stays usable.
    Timeout,
    /// The caller's cancellation token fired first. Local to this call.
    Canceled,
    /// The peer's handler failed; its error is carried back verbatim.
    Remote(WireError),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            CallError::ConnectionFault(msg) => write!(f, "connection fault: {msg}"),
            CallError::Timeout => write!(f, "call timed out"),
            CallError::Canceled => write!(f, "call canceled"),
            CallError::Remote(e) => write!(f, "remote error: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// Error establishing a connection through the registry.
#[derive(Debug)]
pub enum ConnectError {
    /// The transport-specific dial failed.
    Dial(io::Error),
    /// The connect timeout elapsed before the dial completed.
    Timeout,
    /// The caller's cancellation token fired during the dial.
    Canceled,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Dial(e) => write!(f, "dial failed: {e}"),
            ConnectError::Timeout => write!(f, "connect timed out"),
            ConnectError::Canceled => write!(f, "connect canceled"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Dial(e) => Some(e),
            _ => None,
        }
    }
}
