//! Transport plug-in contract.
//!
//! A transport is anything that can dial out to a keyed endpoint and/or
//! accept inbound streams: TCP, Unix domain sockets, or an in-process
//! duplex pair in tests. The runtime only needs the byte stream; framing
//! and multiplexing live above this boundary.

use std::future::Future;
use std::hash::Hash;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// A logical endpoint address usable as a registry key.
///
/// Value equality must match the transport's addressing semantics: two
/// keys are equal exactly when they name the same place to connect to.
/// That equality decides pooling granularity - call sites with equal
/// keys share one connection.
pub trait Endpoint:
    Clone + Eq + Hash + std::fmt::Debug + std::fmt::Display + Send + Sync + 'static
{
}

impl<T> Endpoint for T where
    T: Clone + Eq + Hash + std::fmt::Debug + std::fmt::Display + Send + Sync + 'static
{
}

/// Outbound side of a transport: dial a keyed endpoint.
pub trait Connector: Send + Sync + 'static {
    type Key: Endpoint;
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Establish a new stream to `key`. Deadline and cancellation are
    /// applied by the caller (the registry).
    fn dial(&self, key: &Self::Key) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Inbound side of a transport: an accept loop source.
///
/// The listener holds no per-connection state; ownership of each
/// accepted stream passes to the acceptor-role connection wrapped
/// around it.
pub trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next inbound stream.
    ///
    /// Implementations must observe `token` so a host can wind down the
    /// accept loop; report cancellation as an [`io::ErrorKind::Interrupted`]
    /// error.
    fn accept_next(
        &mut self,
        token: &CancellationToken,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Human-readable label for the listening address, used to name
    /// acceptor connections.
    fn local_label(&self) -> String;
}
