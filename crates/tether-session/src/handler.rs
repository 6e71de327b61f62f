//! The local handler contract and the around-dispatch hook.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tether_wire::WireError;
use tokio_util::sync::CancellationToken;

/// Type alias for the boxed futures handlers and hooks return.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one handler invocation: a result payload, or a structured
/// error sent back to the caller verbatim.
pub type HandlerResult = Result<Value, WireError>;

/// A local service the dispatcher can invoke for inbound requests.
///
/// The dispatcher calls `invoke` once per inbound Request, concurrently
/// with other invocations. The token fires if the peer sends a Cancel
/// frame for this request (or the call budget runs out); handlers should
/// observe it at their own suspension points and bail early. A handler
/// that ignores it still cannot wedge the connection - only its own
/// response is affected.
///
/// The returned future must be `'static`: invocations are spawned as
/// independent units of concurrency, so implementations clone what they
/// need into the future.
pub trait Handler: Send + Sync + 'static {
    fn invoke(
        &self,
        method: String,
        args: Value,
        token: CancellationToken,
    ) -> BoxFuture<'static, HandlerResult>;
}

/// Endpoint name -> handler bindings for one side of a connection.
#[derive(Clone, Default)]
pub struct HandlerMap {
    endpoints: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler under an endpoint name, replacing any previous
    /// binding for that name.
    pub fn bind(mut self, endpoint: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.endpoints.insert(endpoint.into(), handler);
        self
    }

    pub fn get(&self, endpoint: &str) -> Option<&Arc<dyn Handler>> {
        self.endpoints.get(endpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerMap")
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Identity of one inbound request, as seen by a [`DispatchHook`].
#[derive(Debug, Clone)]
pub struct HookContext {
    pub connection: String,
    pub endpoint: String,
    pub method: String,
}

/// Extension point composed around inbound request dispatch.
///
/// This is where access-control or impersonation policy plugs in: the
/// hook decides whether and how to run `next` (the actual handler
/// invocation). The runtime itself has no policy; the default is to run
/// `next` directly.
pub trait DispatchHook: Send + Sync + 'static {
    fn around(
        &self,
        ctx: HookContext,
        next: BoxFuture<'static, HandlerResult>,
    ) -> BoxFuture<'static, HandlerResult>;
}

/// A [`Handler`] built from a plain async closure, for endpoints that
/// don't need their own type.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(String, Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(String, Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn invoke(
        &self,
        method: String,
        args: Value,
        token: CancellationToken,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(method, args, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fn_handler_dispatches_on_method() {
        let handler = FnHandler::new(|method: String, args: Value, _token| async move {
            match method.as_str() {
                "echo" => Ok(args),
                other => Err(WireError::new("UnknownMethod", other)),
            }
        });

        let ok = handler
            .invoke("echo".into(), json!(41), CancellationToken::new())
            .await;
        assert_eq!(ok.unwrap(), json!(41));

        let err = handler
            .invoke("nope".into(), Value::Null, CancellationToken::new())
            .await;
        assert_eq!(err.unwrap_err().kind, "UnknownMethod");
    }

    #[test]
    fn handler_map_replaces_on_rebind() {
        let a = FnHandler::new(|_, _, _| async { Ok(json!(1)) });
        let b = FnHandler::new(|_, _, _| async { Ok(json!(2)) });
        let map = HandlerMap::new().bind("svc", a).bind("svc", b.clone());
        assert!(map.get("svc").is_some());
        assert!(map.get("other").is_none());
    }
}
