#![deny(unsafe_code)]

//! tether-stream: socket transports for tether RPC.
//!
//! Provides [`Connector`](tether_session::Connector) and
//! [`Listener`](tether_session::Listener) implementations over TCP and,
//! on Unix platforms, Unix domain sockets. The session layer never
//! touches sockets directly; these adapters are the only place transport
//! specifics live.

mod tcp;
#[cfg(unix)]
mod unix;

pub use tcp::{TcpConnector, TcpEndpoint, TcpServer};
#[cfg(unix)]
pub use unix::{UnixConnector, UnixEndpoint, UnixServer};
