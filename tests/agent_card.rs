//! Agent-card rewrite and task-operation routing.

use axum::extract::RawQuery;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use a2a_relay::bus::memory::MemoryBus;
use a2a_relay::bus::Bus;
use a2a_relay::config::Config;
use a2a_relay::routing;

async fn serve_router(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn mock_agent() -> SocketAddr {
    let app = Router::new()
        .route(
            "/.well-known/agent.json",
            get(|| async {
                Json(json!({
                    "name": "writer",
                    "description": "writes things",
                    "url": "http://writer.internal:9101",
                    "version": "1.0.0"
                }))
            }),
        )
        .route(
            "/v1/tasks:get",
            get(|RawQuery(query): RawQuery| async move {
                Json(json!({
                    "jsonrpc": "2.0",
                    "result": {"query": query},
                    "id": "q1"
                }))
            }),
        )
        .route(
            "/v1/tasks:cancel",
            post(|Json(request): Json<Value>| async move {
                Json(json!({
                    "jsonrpc": "2.0",
                    "result": {"cancelled": true},
                    "id": request["id"]
                }))
            }),
        );
    serve_router(app).await
}

async fn start_hosting_proxy(writer_host: SocketAddr) -> SocketAddr {
    let bus = Arc::new(MemoryBus::new());
    let config = Config::from_toml_str(&format!(
        r#"
        [proxy]
        id = "p1"
        role = "coordinator"
        public_base_url = "http://proxy.example.com"

        [[groups]]
        name = "blog-agents"

        [[agents]]
        id = "writer"
        group = "blog-agents"
        proxy_id = "p1"
        host_port = "{writer_host}"
    "#
    ))
    .unwrap();
    bus.ensure_topology(&config.groups).await.unwrap();

    let state = routing::build_state(Arc::new(config), bus).unwrap();
    let _background = routing::spawn_background(&state);
    serve_router(routing::build_router(state)).await
}

#[tokio::test]
async fn local_card_url_is_rewritten_to_the_proxy() {
    let writer = mock_agent().await;
    let proxy = start_hosting_proxy(writer).await;

    let card: Value = reqwest::get(format!(
        "http://{proxy}/agents/writer/.well-known/agent.json"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(card["name"], "writer");
    assert_eq!(card["version"], "1.0.0");
    assert_eq!(card["url"], "http://proxy.example.com/agents/writer");
}

#[tokio::test]
async fn unreachable_agent_yields_minimal_card_with_200() {
    // Port 1: connection refused.
    let proxy = start_hosting_proxy("127.0.0.1:1".parse().unwrap()).await;

    let response = reqwest::get(format!(
        "http://{proxy}/agents/writer/.well-known/agent.json"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);

    let card: Value = response.json().await.unwrap();
    assert_eq!(card["name"], "writer");
    assert_eq!(card["url"], "http://proxy.example.com/agents/writer");
    assert_eq!(card["version"], "unknown");
    assert_eq!(card["error"], "Agent unavailable");
}

#[tokio::test]
async fn unknown_agent_card_is_404() {
    let writer = mock_agent().await;
    let proxy = start_hosting_proxy(writer).await;

    let response = reqwest::get(format!(
        "http://{proxy}/agents/ghost/.well-known/agent.json"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn proxy_serves_its_own_card() {
    let writer = mock_agent().await;
    let proxy = start_hosting_proxy(writer).await;

    let card: Value = reqwest::get(format!("http://{proxy}/.well-known/agent.json"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(card["name"], "A2A Relay p1");
    assert_eq!(card["url"], "http://proxy.example.com");
    assert_eq!(card["capabilities"]["streaming"], true);
    assert_eq!(card["role"], "coordinator");
}

#[tokio::test]
async fn tasks_get_forwards_query_verbatim() {
    let writer = mock_agent().await;
    let proxy = start_hosting_proxy(writer).await;

    let body: Value = reqwest::get(format!(
        "http://{proxy}/agents/writer/v1/tasks:get?id=task-9"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(body["result"]["query"], "id=task-9");
}

#[tokio::test]
async fn tasks_cancel_routes_like_messages_send() {
    let writer = mock_agent().await;
    let proxy = start_hosting_proxy(writer).await;

    let body: Value = reqwest::Client::new()
        .post(format!("http://{proxy}/agents/writer/v1/tasks:cancel"))
        .json(&json!({"jsonrpc": "2.0", "method": "tasks/cancel", "params": {"id": "task-9"}, "id": "c1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"]["cancelled"], true);
    assert_eq!(body["id"], "c1");
}
