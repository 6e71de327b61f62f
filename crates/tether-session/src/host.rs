//! Accept loop wiring: turn a [`Listener`] into a family of acceptor
//! connections sharing one handler table.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::handler::HandlerMap;
use crate::transport::Listener;

/// Pause after a transient accept error before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Serves handlers to every peer that connects.
///
/// Each accepted stream becomes a full [`Connection`], so handlers run
/// for inbound calls and the host side may equally initiate calls back
/// over the same stream.
pub struct Host {
    handlers: Arc<HandlerMap>,
    config: ConnectionConfig,
    shutdown: CancellationToken,
    accepted: AtomicU64,
    connections: Mutex<Vec<Weak<Connection>>>,
}

impl Host {
    pub fn new(handlers: HandlerMap) -> Self {
        Self {
            handlers: Arc::new(handlers),
            config: ConnectionConfig::default(),
            shutdown: CancellationToken::new(),
            accepted: AtomicU64::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Token observed by `serve`; cancel it (or call [`Host::shutdown`])
    /// to stop accepting.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Live connections accepted so far.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .collect()
    }

    /// Run the accept loop until shutdown or a fatal listener error.
    ///
    /// Transient accept failures (the listener is still usable) are
    /// logged and retried after a short pause; anything else tears the
    /// loop down. Connections already accepted keep running either way.
    pub async fn serve<L: Listener>(self: &Arc<Self>, mut listener: L) -> io::Result<()> {
        let label = listener.local_label();
        info!(%label, "accepting connections");

        loop {
            match listener.accept_next(&self.shutdown).await {
                Ok(stream) => {
                    let seq = self.accepted.fetch_add(1, Ordering::Relaxed);
                    let conn = Connection::spawn(
                        format!("{label}#acceptor-{seq}"),
                        stream,
                        self.handlers.clone(),
                        self.config.clone(),
                    );
                    self.track(&conn);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    info!(%label, "accept loop stopped");
                    return Ok(());
                }
                Err(e) if is_transient(&e) => {
                    warn!(%label, error = %e, "accept failed, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(%label, error = %e, "accept loop failed");
                    return Err(e);
                }
            }
        }
    }

    /// Stop accepting and close every accepted connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let live: Vec<Arc<Connection>> = {
            let mut conns = self.connections.lock();
            conns.drain(..).filter_map(|w| w.upgrade()).collect()
        };
        for conn in live {
            conn.close().await;
        }
    }

    fn track(&self, conn: &Arc<Connection>) {
        let mut conns = self.connections.lock();
        conns.retain(|w| w.upgrade().is_some_and(|c| !c.is_closed()));
        conns.push(Arc::downgrade(conn));
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("accepted", &self.accepted.load(Ordering::Relaxed))
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

/// Accept errors that leave the listener itself intact, typically a
/// peer that dropped mid-handshake or transient resource pressure.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::WouldBlock
    )
}
