//! Unix domain socket transport.

use std::future::Future;
use std::io;
use std::path::PathBuf;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_session::{Connector, Listener};

/// A Unix socket path used as a registry key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct UnixEndpoint(pub PathBuf);

impl From<PathBuf> for UnixEndpoint {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl std::fmt::Display for UnixEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unix://{}", self.0.display())
    }
}

#[derive(Debug, Default, Clone)]
pub struct UnixConnector;

impl Connector for UnixConnector {
    type Key = UnixEndpoint;
    type Stream = UnixStream;

    fn dial(&self, key: &UnixEndpoint) -> impl Future<Output = io::Result<UnixStream>> + Send {
        let path = key.0.clone();
        async move { UnixStream::connect(path).await }
    }
}

/// Accepting side of the Unix socket transport. Removes a stale socket
/// file at the bind path before binding.
#[derive(Debug)]
pub struct UnixServer {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixServer {
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "unix listener bound");
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Listener for UnixServer {
    type Stream = UnixStream;

    fn accept_next(
        &mut self,
        token: &CancellationToken,
    ) -> impl Future<Output = io::Result<UnixStream>> + Send {
        async move {
            tokio::select! {
                _ = token.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "listener shut down"))
                }
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted?;
                    debug!(path = %self.path.display(), "accepted unix connection");
                    Ok(stream)
                }
            }
        }
    }

    fn local_label(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

impl Drop for UnixServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
