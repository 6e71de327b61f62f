#![deny(unsafe_code)]

//! tether-session: the connection and dispatch runtime for tether RPC.
//!
//! This crate turns one raw duplex byte stream into a multiplexed,
//! bidirectional call channel. Either side of a connection can issue
//! calls and answer the peer's calls at the same time, over the same
//! stream.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────┐
//!                  │            Connection            │
//!                  ├──────────────────────────────────┤
//!                  │  writer: Mutex<FrameWriter>      │
//!                  │  pending: correlation id ->      │
//!                  │           oneshot::Sender        │
//!                  │  inbound: correlation id ->      │
//!                  │           CancellationToken      │
//!                  │  handlers: endpoint -> Handler   │
//!                  └──────────────┬───────────────────┘
//!                                 │
//!                            demux loop
//!                                 │
//!        ┌────────────────────────┼────────────────────────┐
//!        │                        │                        │
//!  Response? (pending)    Cancel? (inbound)      Request? (dispatch)
//!        │                        │                        │
//! ┌──────▼───────┐     ┌──────────▼────────┐   ┌───────────▼──────────┐
//! │ Resolve the  │     │ Fire the running  │   │ Spawn the handler,   │
//! │ waiting call │     │ handler's token   │   │ send Response back   │
//! └──────────────┘     └───────────────────┘   └──────────────────────┘
//! ```
//!
//! Only the demux loop reads from the stream; only the serialized writer
//! writes to it. The completions those frames trigger run concurrently
//! with each other and with new outbound calls.
//!
//! # Key invariants
//!
//! - Correlation ids are unique for a connection's lifetime and pair
//!   requests with responses regardless of arrival order.
//! - A pending call resolves exactly once, with whichever of
//!   {response, timeout, cancellation, connection fault} happens first.
//! - A handler failure becomes an error Response frame; it can never
//!   take down the demux loop or other in-flight calls.

mod connection;
mod error;
mod handler;
mod host;
mod pool;
mod registry;
mod transport;

pub use connection::{CallOptions, Connection, ConnectionConfig};
pub use error::{CallError, ConnectError};
pub use handler::{
    BoxFuture, DispatchHook, FnHandler, Handler, HandlerMap, HandlerResult, HookContext,
};
pub use host::Host;
pub use pool::{Recycle, ResourcePool};
pub use registry::Registry;
pub use transport::{Connector, Endpoint, Listener};

// Re-export the wire types callers interact with.
pub use tether_wire::{Message, ProtocolError, Value, WireError};

// Re-export the cancellation primitive used throughout the API surface.
pub use tokio_util::sync::CancellationToken;
