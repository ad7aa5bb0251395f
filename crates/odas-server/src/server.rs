use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use odas_core::{Category, RelayError};
use odas_telemetry::{names, MetricsRecorder};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::assets;
use crate::client::{self, Heartbeat, WsChannel};
use crate::coordinator::RelayCoordinator;
use crate::hub::{BroadcastHub, PushChannel};
use crate::listener::{SourceListener, DEFAULT_READ_BUFFER_SIZE};

/// Relay configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_address: IpAddr,
    pub http_port: u16,
    pub tracking_port: u16,
    pub potential_port: u16,
    pub public_dir: PathBuf,
    pub max_send_queue: usize,
    pub read_buffer_size: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 8080,
            tracking_port: 9000,
            potential_port: 9001,
            public_dir: PathBuf::from("public"),
            max_send_queue: 256,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_address, port)
    }

    /// Upstream TCP port for a category.
    pub fn port_for(&self, category: Category) -> u16 {
        match category {
            Category::Tracking => self.tracking_port,
            Category::Potential => self.potential_port,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub metrics: Arc<MetricsRecorder>,
    pub public_dir: Arc<PathBuf>,
    pub max_send_queue: usize,
    pub heartbeat: Heartbeat,
    pub started_at: DateTime<Utc>,
    pub shutdown: CancellationToken,
}

/// Build the Axum router. Any path upgrades to a WebSocket when asked to;
/// otherwise it is served from the public directory.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(root_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind all three ports and start relaying. Returns a handle to shut it down.
pub async fn start(
    config: RelayConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, RelayError> {
    let mut listeners = Vec::new();
    for category in Category::ALL {
        let listener = SourceListener::bind(
            category,
            config.addr(config.port_for(category)),
            Arc::clone(&metrics),
        )
        .await?
        .with_read_buffer_size(config.read_buffer_size);
        listeners.push(listener);
    }

    let http_addr = config.addr(config.http_port);
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(|source| RelayError::Bind {
            addr: http_addr,
            source,
        })?;
    let local_addr = http_listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let hub = Arc::new(BroadcastHub::new(Arc::clone(&metrics)));
    let coordinator = Arc::new(RelayCoordinator::new(Arc::clone(&hub)));

    let mut tasks = Vec::new();
    let mut upstream_ports = Vec::new();
    for listener in listeners {
        upstream_ports.push((listener.category(), listener.local_addr()?.port()));
        tasks.push(coordinator.attach(listener, shutdown.clone()));
    }

    tasks.push(client::start_cleanup_task(
        Arc::clone(&hub),
        config.cleanup_interval,
        shutdown.clone(),
    ));

    let app_state = AppState {
        hub: Arc::clone(&hub),
        metrics,
        public_dir: Arc::new(config.public_dir.clone()),
        max_send_queue: config.max_send_queue,
        heartbeat: Heartbeat {
            interval: config.heartbeat_interval,
            timeout: config.client_timeout,
        },
        started_at: Utc::now(),
        shutdown: shutdown.clone(),
    };

    let router = build_router(app_state);

    tracing::info!(port = local_addr.port(), "ODAS relay HTTP server started");

    let serve_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, router)
            .with_graceful_shutdown(serve_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "HTTP server failed");
        }
    }));

    Ok(ServerHandle {
        http_port: local_addr.port(),
        upstream_ports,
        hub,
        shutdown,
        tasks,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub http_port: u16,
    upstream_ports: Vec<(Category, u16)>,
    hub: Arc<BroadcastHub>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound upstream port for a category.
    pub fn upstream_port(&self, category: Category) -> u16 {
        self.upstream_ports
            .iter()
            .find(|(c, _)| *c == category)
            .map_or(0, |(_, port)| *port)
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Stop accepting, close every connection and drop all subscribers.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        let dropped = self.hub.reset();
        tracing::info!(subscribers = dropped, "ODAS relay stopped");
    }
}

/// Upgrade to a WebSocket subscriber, or serve a static file.
async fn root_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    uri: Uri,
) -> Response {
    if let Ok(ws) = ws {
        return ws
            .on_upgrade(move |socket| handle_socket(socket, state))
            .into_response();
    }

    match assets::load(&state.public_dir, uri.path()).await {
        Some(asset) => (
            [(header::CONTENT_TYPE, asset.content_type)],
            asset.bytes,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

/// Register a new browser with the hub and drive it until it goes away.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (channel, rx) = WsChannel::new(state.max_send_queue, state.heartbeat.timeout);
    state.hub.register(channel.clone());
    tracing::info!(subscriber_id = %channel.id(), "Browser connected");

    client::handle_ws_connection(
        socket,
        channel,
        rx,
        state.hub,
        state.heartbeat,
        state.shutdown,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let upstream: serde_json::Map<String, serde_json::Value> = Category::ALL
        .iter()
        .map(|category| {
            let active = state
                .metrics
                .gauge_get(names::CONNECTIONS_ACTIVE, &[("category", category.as_str())]);
            (category.as_str().to_owned(), serde_json::Value::Bool(active > 0))
        })
        .collect();

    axum::Json(serde_json::json!({
        "status": "healthy",
        "started_at": state.started_at.to_rfc3339(),
        "upstream": upstream,
        "subscribers": state.hub.count(),
        "metrics": state.metrics.snapshot(),
    }))
}
