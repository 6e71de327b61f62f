//! Round trip over a Unix domain socket.

#![cfg(unix)]

use std::sync::Arc;

use serde_json::{json, Value};
use tether_session::{CallOptions, CancellationToken, FnHandler, HandlerMap, Host, Registry};
use tether_stream::{UnixConnector, UnixEndpoint, UnixServer};

#[tokio::test]
async fn echo_over_unix_socket() {
    let dir = std::env::temp_dir().join(format!("tether-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("echo.sock");

    let handlers = HandlerMap::new().bind(
        "echo",
        FnHandler::new(|_method: String, args: Value, _token| async move { Ok(args) }),
    );
    let host = Arc::new(Host::new(handlers));
    let server = UnixServer::bind(&path).unwrap();
    let serve_host = host.clone();
    tokio::spawn(async move { serve_host.serve(server).await });

    let registry = Arc::new(Registry::new(UnixConnector));
    let token = CancellationToken::new();
    let endpoint = UnixEndpoint(path.clone());

    let conn = registry.get_or_connect(&endpoint, &token).await.unwrap();
    let result = conn
        .call("echo", "say", json!({"msg": "over unix"}), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!({"msg": "over unix"}));

    host.shutdown().await;
    let _ = std::fs::remove_dir_all(&dir);
}
