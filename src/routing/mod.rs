//! Routing engine: HTTP ingress, local forwarding, and the bus-side
//! background tasks.
//!
//! Ingress wraps requests into envelopes and dispatches them either to a
//! co-located agent over HTTP or across the bus, then awaits the
//! correlated reply through the pending registry. A background request
//! receiver runs per hosted agent, and one shared response subscriber per
//! group fans replies into the registry.

pub mod agent_card;
pub mod forward;
pub mod ingress;
pub mod receiver;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::bus::publisher::BusPublisher;
use crate::bus::Bus;
use crate::config::Config;
use crate::directory::AgentDirectory;
use crate::pending::PendingRegistry;

/// Maximum ingress request body (1 MB), matching the bus message cap.
pub const MAX_BODY_SIZE: usize = 1_048_576;

/// Shared state for all axum handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<AgentDirectory>,
    pub registry: Arc<PendingRegistry>,
    pub bus: Arc<dyn Bus>,
    pub publisher: Arc<BusPublisher>,
    pub http: reqwest::Client,
}

pub fn build_state(config: Arc<Config>, bus: Arc<dyn Bus>) -> Result<AppState> {
    let directory = Arc::new(AgentDirectory::from_config(&config));
    let registry = Arc::new(PendingRegistry::new());
    let publisher = Arc::new(BusPublisher::new(Arc::clone(&bus), &config.bus));
    let http = forward::build_http_client()?;
    Ok(AppState {
        config,
        directory,
        registry,
        bus,
        publisher,
        http,
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(ingress::handle_health))
        .route("/.well-known/agent.json", get(ingress::handle_proxy_card))
        .route(
            "/agents/{id}/.well-known/agent.json",
            get(ingress::handle_agent_card),
        )
        .route(
            "/agents/{id}/v1/messages:send",
            post(ingress::handle_message_send),
        )
        .route(
            "/agents/{id}/v1/messages:stream",
            post(ingress::handle_message_stream),
        )
        .route("/agents/{id}/v1/tasks:get", get(ingress::handle_tasks_get))
        .route(
            "/agents/{id}/v1/tasks:cancel",
            post(ingress::handle_tasks_cancel),
        )
        .route(
            "/agents/{id}/v1/tasks:resubscribe",
            post(ingress::handle_tasks_resubscribe),
        )
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
}

/// Start the registry sweeper and all bus-side receivers.
pub fn spawn_background(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = vec![PendingRegistry::spawn_sweeper(Arc::clone(&state.registry))];
    handles.extend(receiver::spawn_request_receivers(state));
    handles.extend(receiver::spawn_response_subscribers(state));
    handles
}

/// Bind the ingress listener and serve until termination.
pub async fn serve(config: Config, bus: Arc<dyn Bus>) -> Result<()> {
    let addr = format!("{}:{}", config.proxy.host, config.proxy.port);
    let state = build_state(Arc::new(config), bus)?;
    let _background = spawn_background(&state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, proxy_id = %state.config.proxy.id, "proxy listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .await
        .context("http server terminated")
}
