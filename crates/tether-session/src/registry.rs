//! Keyed registry of initiator connections.
//!
//! Holds at most one live connection per endpoint key and dials on
//! demand. Concurrent `get_or_connect` calls for the same key collapse
//! into one dial; a faulted connection evicts itself so the next access
//! establishes a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ConnectError;
use crate::handler::HandlerMap;
use crate::transport::Connector;

/// Per-key dial slot. Holding the inner lock across the dial is what
/// makes dialing single-flight for that key without blocking others.
type Slot = Arc<AsyncMutex<Option<Arc<Connection>>>>;

/// Client-side connection registry.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tether_session::{Registry, Connector};
/// # async fn demo<C: Connector>(connector: C, key: C::Key) {
/// let registry = Arc::new(Registry::new(connector));
/// let token = tokio_util::sync::CancellationToken::new();
/// let conn = registry.get_or_connect(&key, &token).await.unwrap();
/// # }
/// ```
pub struct Registry<C: Connector> {
    connector: C,
    handlers: Arc<HandlerMap>,
    config: ConnectionConfig,
    dial_timeout: Duration,
    slots: Mutex<HashMap<C::Key, Slot>>,
}

impl<C: Connector> Registry<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            handlers: Arc::new(HandlerMap::new()),
            config: ConnectionConfig::default(),
            dial_timeout: Duration::from_secs(10),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Handlers served on every connection this registry establishes,
    /// making each one fully bidirectional.
    pub fn handlers(mut self, handlers: HandlerMap) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Return the live connection for `key`, dialing if there is none.
    ///
    /// Waits on the per-key slot if another task is already dialing the
    /// same key, then shares that task's outcome instead of opening a
    /// second stream.
    pub async fn get_or_connect(
        self: &Arc<Self>,
        key: &C::Key,
        token: &CancellationToken,
    ) -> Result<Arc<Connection>, ConnectError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(conn) = guard.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            // Eviction lost a race with us; clear the stale entry here.
            *guard = None;
        }

        let conn = self.dial(key, token).await?;

        let registry = Arc::downgrade(self);
        let evict_key = key.clone();
        conn.on_closed(move || {
            if let Some(registry) = registry.upgrade() {
                registry.evict(&evict_key);
            }
        });

        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// The current connection for `key`, if a live one is registered.
    /// Never dials.
    pub fn peek(&self, key: &C::Key) -> Option<Arc<Connection>> {
        let slot = self.slots.lock().get(key).cloned()?;
        let guard = slot.try_lock().ok()?;
        guard.as_ref().filter(|c| !c.is_closed()).cloned()
    }

    /// Close every registered connection.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            let conn = slot.lock().await.take();
            if let Some(conn) = conn {
                conn.close().await;
            }
        }
    }

    fn slot(&self, key: &C::Key) -> Slot {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    async fn dial(
        &self,
        key: &C::Key,
        token: &CancellationToken,
    ) -> Result<Arc<Connection>, ConnectError> {
        debug!(%key, "dialing");
        let dial = self.connector.dial(key);
        tokio::pin!(dial);

        let stream = tokio::select! {
            result = &mut dial => result.map_err(ConnectError::Dial)?,
            _ = tokio::time::sleep(self.dial_timeout) => return Err(ConnectError::Timeout),
            _ = token.cancelled() => return Err(ConnectError::Canceled),
        };

        Ok(Connection::spawn(
            format!("{key}#initiator"),
            stream,
            self.handlers.clone(),
            self.config.clone(),
        ))
    }

    /// Drop the registered connection for `key` if it is the one that
    /// closed. Runs from the fault path, so it must not wait: if a dial
    /// holds the slot, the liveness check in `get_or_connect` covers it.
    fn evict(&self, key: &C::Key) {
        let slot = self.slots.lock().get(key).cloned();
        let Some(slot) = slot else { return };
        let Ok(mut guard) = slot.try_lock() else { return };
        if guard.as_ref().is_some_and(|c| c.is_closed()) {
            debug!(%key, "evicting closed connection");
            *guard = None;
        }
    }
}

impl<C: Connector> std::fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.slots.lock().len())
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}
