//! TCP transport.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_session::{Connector, Listener};

/// A TCP peer address used as a registry key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TcpEndpoint(pub SocketAddr);

impl From<SocketAddr> for TcpEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tcp://{}", self.0)
    }
}

/// Dials TCP streams with `TCP_NODELAY` set; small RPC frames should
/// not sit in Nagle's buffer.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Key = TcpEndpoint;
    type Stream = TcpStream;

    fn dial(&self, key: &TcpEndpoint) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = key.0;
        async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

/// Accepting side of the TCP transport.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, "tcp listener bound");
        Ok(Self { listener })
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for TcpServer {
    type Stream = TcpStream;

    fn accept_next(
        &mut self,
        token: &CancellationToken,
    ) -> impl Future<Output = io::Result<TcpStream>> + Send {
        async move {
            tokio::select! {
                _ = token.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "listener shut down"))
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    stream.set_nodelay(true)?;
                    debug!(%peer, "accepted tcp connection");
                    Ok(stream)
                }
            }
        }
    }

    fn local_label(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp://{addr}"),
            Err(_) => "tcp://?".to_owned(),
        }
    }
}
