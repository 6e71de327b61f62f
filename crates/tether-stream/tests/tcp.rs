//! End-to-end RPC over real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tether_session::{
    CallOptions, CancellationToken, FnHandler, HandlerMap, Host, Registry, WireError,
};
use tether_stream::{TcpConnector, TcpEndpoint, TcpServer};

fn calc_handlers() -> HandlerMap {
    HandlerMap::new().bind(
        "calc",
        FnHandler::new(|method: String, args: Value, _token| async move {
            match method.as_str() {
                "sum" => {
                    let a = args["a"].as_i64().unwrap_or(0);
                    let b = args["b"].as_i64().unwrap_or(0);
                    Ok(json!(a + b))
                }
                other => Err(WireError::new("UnknownMethod", other.to_owned())),
            }
        }),
    )
}

async fn start_host(handlers: HandlerMap) -> (Arc<Host>, TcpEndpoint) {
    let host = Arc::new(Host::new(handlers));
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let endpoint = TcpEndpoint(server.local_addr().unwrap());
    let serve_host = host.clone();
    tokio::spawn(async move { serve_host.serve(server).await });
    (host, endpoint)
}

#[tokio::test]
async fn sum_over_tcp() {
    let (_host, endpoint) = start_host(calc_handlers()).await;
    let registry = Arc::new(Registry::new(TcpConnector));
    let token = CancellationToken::new();

    let conn = registry.get_or_connect(&endpoint, &token).await.unwrap();
    let result = conn
        .call("calc", "sum", json!({"a": 19, "b": 23}), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!(42));

    // Same connection serves the next call.
    let again = registry.get_or_connect(&endpoint, &token).await.unwrap();
    assert!(Arc::ptr_eq(&conn, &again));
}

#[tokio::test]
async fn host_calls_back_over_the_same_stream() {
    let (host, endpoint) = start_host(calc_handlers()).await;

    // The client serves an endpoint of its own on the dialed connection.
    let client_handlers = HandlerMap::new().bind(
        "notify",
        FnHandler::new(|_method: String, args: Value, _token| async move {
            Ok(json!({"ack": args}))
        }),
    );
    let registry = Arc::new(Registry::new(TcpConnector).handlers(client_handlers));
    let token = CancellationToken::new();
    let conn = registry.get_or_connect(&endpoint, &token).await.unwrap();

    // Prime the stream so the host has accepted it.
    conn.call("calc", "sum", json!({"a": 0, "b": 0}), CallOptions::new())
        .await
        .unwrap();

    let accepted = host.connections();
    assert_eq!(accepted.len(), 1);
    let result = accepted[0]
        .call("notify", "event", json!("hello"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!({"ack": "hello"}));
}

#[tokio::test]
async fn closed_connection_is_redialed() {
    let (host, endpoint) = start_host(calc_handlers()).await;
    let registry = Arc::new(Registry::new(TcpConnector));
    let token = CancellationToken::new();

    let first = registry.get_or_connect(&endpoint, &token).await.unwrap();
    first
        .call("calc", "sum", json!({"a": 1, "b": 2}), CallOptions::new())
        .await
        .unwrap();

    // Drop the accepted side; the client observes a fault.
    for conn in host.connections() {
        conn.close().await;
    }
    first.closed().await;

    // The registry evicts and dials fresh on the next access.
    for _ in 0..50 {
        if registry.peek(&endpoint).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let second = registry.get_or_connect(&endpoint, &token).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    let result = second
        .call("calc", "sum", json!({"a": 2, "b": 2}), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!(4));
}

#[tokio::test]
async fn host_shutdown_stops_the_accept_loop() {
    let handlers = calc_handlers();
    let host = Arc::new(Host::new(handlers));
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let endpoint = TcpEndpoint(server.local_addr().unwrap());

    let serve = {
        let host = host.clone();
        tokio::spawn(async move { host.serve(server).await })
    };

    let registry = Arc::new(Registry::new(TcpConnector));
    let token = CancellationToken::new();
    let conn = registry.get_or_connect(&endpoint, &token).await.unwrap();
    conn.call("calc", "sum", json!({"a": 5, "b": 5}), CallOptions::new())
        .await
        .unwrap();

    host.shutdown().await;

    // The accept loop exits cleanly and accepted connections close.
    serve.await.unwrap().unwrap();
    conn.closed().await;
    assert!(conn.is_closed());
}
