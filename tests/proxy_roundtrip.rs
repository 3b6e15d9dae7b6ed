//! End-to-end routing scenarios over real HTTP listeners and the
//! in-process bus: local passthrough, cross-proxy round-trip, request
//! timeout with late-reply drop, and unknown-agent rejection.

use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use a2a_relay::bus::envelope::{Envelope, Head, ReplyEnvelope};
use a2a_relay::bus::memory::MemoryBus;
use a2a_relay::bus::{requests_topic, responses_topic, Bus, Selector, SubscriptionSpec};
use a2a_relay::config::Config;
use a2a_relay::routing;

// ── Harness ─────────────────────────────────────────────────────

async fn serve_router(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Minimal agent that answers `messages:send` with a fixed result.
async fn mock_agent(task_id: &'static str) -> SocketAddr {
    let app = Router::new().route(
        "/v1/messages:send",
        post(move |Json(request): Json<Value>| async move {
            Json(json!({
                "jsonrpc": "2.0",
                "result": {"id": task_id},
                "id": request["id"],
            }))
        }),
    );
    serve_router(app).await
}

struct TestProxy {
    addr: SocketAddr,
    state: routing::AppState,
}

async fn start_proxy(config: Config, bus: Arc<dyn Bus>) -> TestProxy {
    let state = routing::build_state(Arc::new(config), bus).unwrap();
    let _background = routing::spawn_background(&state);
    let addr = serve_router(routing::build_router(state.clone())).await;
    TestProxy { addr, state }
}

fn two_proxy_config(proxy_id: &str, writer_host: Option<SocketAddr>, timeout_secs: u64) -> Config {
    // Writer is hosted here when an address is given, otherwise it lives
    // on a proxy that never starts.
    let writer_block = match writer_host {
        Some(addr) => format!(
            "[[agents]]\nid = \"writer\"\ngroup = \"blog-agents\"\nproxy_id = \"{proxy_id}\"\nhost_port = \"{addr}\"\n"
        ),
        None => {
            "[[agents]]\nid = \"writer\"\ngroup = \"blog-agents\"\nproxy_id = \"p0\"\n".to_string()
        }
    };
    Config::from_toml_str(&format!(
        r#"
        [proxy]
        id = "{proxy_id}"
        role = "coordinator"
        request_timeout_secs = {timeout_secs}

        [[groups]]
        name = "blog-agents"

        {writer_block}

        [[agents]]
        id = "critic"
        group = "blog-agents"
        proxy_id = "p2"
    "#
    ))
    .unwrap()
}

/// Proxy pair config where critic is hosted on p2.
fn hosting_config(proxy_id: &str, critic_host: SocketAddr) -> Config {
    Config::from_toml_str(&format!(
        r#"
        [proxy]
        id = "{proxy_id}"
        role = "follower"

        [[groups]]
        name = "blog-agents"

        [[agents]]
        id = "critic"
        group = "blog-agents"
        proxy_id = "p2"
        host_port = "{critic_host}"
    "#
    ))
    .unwrap()
}

async fn ensure_topology(bus: &MemoryBus) {
    let config = Config::from_toml_str(
        r#"
        [proxy]
        id = "topo"
        role = "coordinator"

        [[groups]]
        name = "blog-agents"
    "#,
    )
    .unwrap();
    bus.ensure_topology(&config.groups).await.unwrap();
}

async fn wait_for_subscriptions(bus: &MemoryBus, topic: &str, count: usize) {
    for _ in 0..200 {
        if bus.subscription_count(topic) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("subscriptions on {topic} never reached {count}");
}

// ── Scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn local_sync_call_bypasses_the_bus() {
    let bus = Arc::new(MemoryBus::new());
    ensure_topology(&bus).await;

    let writer_addr = mock_agent("task-1").await;
    let p1 = start_proxy(
        two_proxy_config("p1", Some(writer_addr), 30),
        Arc::<MemoryBus>::clone(&bus),
    )
    .await;

    // Probe the requests topic: a local call must produce no bus traffic.
    let mut probe = bus
        .subscribe(
            &requests_topic("blog-agents"),
            SubscriptionSpec {
                name: "probe.req".into(),
                selector: Selector::ToAgent("writer".into()),
                max_delivery_count: 3,
            },
        )
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/agents/writer/v1/messages:send",
            p1.addr
        ))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r1"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-correlation-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"jsonrpc": "2.0", "result": {"id": "task-1"}, "id": "r1"})
    );

    // No envelope crossed the bus.
    let silent = tokio::time::timeout(Duration::from_millis(100), probe.recv()).await;
    assert!(silent.is_err(), "local call leaked onto the bus");
}

#[tokio::test]
async fn cross_proxy_sync_call_round_trips() {
    let bus = Arc::new(MemoryBus::new());
    ensure_topology(&bus).await;

    let critic_addr = mock_agent("task-2").await;
    let _p2 = start_proxy(hosting_config("p2", critic_addr), Arc::<MemoryBus>::clone(&bus)).await;
    let p1 = start_proxy(two_proxy_config("p1", None, 30), Arc::<MemoryBus>::clone(&bus)).await;

    wait_for_subscriptions(&bus, &requests_topic("blog-agents"), 1).await;
    wait_for_subscriptions(&bus, &responses_topic("blog-agents"), 2).await;

    // Watch the wire: exactly one request envelope addressed to critic.
    let mut probe = bus
        .subscribe(
            &requests_topic("blog-agents"),
            SubscriptionSpec {
                name: "probe.req".into(),
                selector: Selector::ToAgent("critic".into()),
                max_delivery_count: 3,
            },
        )
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/agents/critic/v1/messages:send",
            p1.addr
        ))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r2"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let correlation = response
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Uuid>().ok())
        .expect("correlation id header");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], "r2");
    assert_eq!(body["result"]["id"], "task-2");

    let delivery = tokio::time::timeout(Duration::from_secs(1), probe.recv())
        .await
        .unwrap()
        .unwrap();
    match &delivery.envelope {
        Envelope::Request(req) => {
            assert_eq!(req.head.to_agent, "critic");
            assert_eq!(req.head.correlation_id, correlation);
            assert_eq!(req.from_proxy, "p1");
            assert!(!req.is_stream);
        }
        other => panic!("expected request envelope, got {}", other.kind_name()),
    }
    delivery.ack();
}

#[tokio::test]
async fn request_timeout_returns_504_and_drops_late_reply() {
    let bus = Arc::new(MemoryBus::new());
    ensure_topology(&bus).await;

    // Critic's hosting proxy never starts; deadline is 1 s.
    let p1 = start_proxy(two_proxy_config("p1", None, 1), Arc::<MemoryBus>::clone(&bus)).await;

    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/agents/critic/v1/messages:send",
            p1.addr
        ))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r3"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 504);
    let correlation = response
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Uuid>().ok())
        .expect("correlation id header");
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32603, "message": "Request timeout"},
            "id": "r3"
        })
    );

    // A reply limping in after the deadline is dropped with a counter bump.
    let late = Envelope::Reply(ReplyEnvelope {
        head: Head::new("blog-agents", "proxy", "critic", correlation),
        to_proxy: "p1".into(),
        status: 200,
        payload: json!({"jsonrpc": "2.0", "result": {}, "id": "r3"}),
    });
    bus.publish(&responses_topic("blog-agents"), &late)
        .await
        .unwrap();

    for _ in 0..100 {
        if p1.state.registry.counters().late_drops() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(p1.state.registry.counters().late_drops(), 1);
    assert_eq!(p1.state.registry.pending_count(), 0);
}

#[tokio::test]
async fn unknown_agent_is_rejected_with_404() {
    let bus = Arc::new(MemoryBus::new());
    ensure_topology(&bus).await;
    let p1 = start_proxy(two_proxy_config("p1", None, 30), Arc::<MemoryBus>::clone(&bus)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/agents/ghost/v1/messages:send", p1.addr))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r4"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32001, "message": "Agent not found"},
            "id": "r4"
        })
    );
}

#[tokio::test]
async fn invalid_json_body_is_rejected_with_400() {
    let bus = Arc::new(MemoryBus::new());
    ensure_topology(&bus).await;
    let p1 = start_proxy(two_proxy_config("p1", None, 30), Arc::<MemoryBus>::clone(&bus)).await;

    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/agents/critic/v1/messages:send",
            p1.addr
        ))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn health_endpoint_reports_identity() {
    let bus = Arc::new(MemoryBus::new());
    ensure_topology(&bus).await;
    let p1 = start_proxy(two_proxy_config("p1", None, 30), Arc::<MemoryBus>::clone(&bus)).await;

    let body: Value = reqwest::get(format!("http://{}/health", p1.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["proxy_id"], "p1");
    assert_eq!(body["agents"], 2);
}
