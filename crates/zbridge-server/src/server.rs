use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use zbridge_cache::CacheManager;
use zbridge_core::{BridgeError, ConnectionId};

use crate::bridge::ExecutionBridge;
use crate::collaborators::Collaborators;
use crate::connection::{
    self, ConnectionRegistry, OverflowPolicy, DEFAULT_QUEUE_CAPACITY,
};
use crate::pending::PendingInputs;
use crate::router::RouterState;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub drain_timeout_secs: u64,
    pub default_cache_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9092,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            drain_timeout_secs: 5,
            default_cache_ttl_secs: zbridge_cache::TTL_DEFAULT_SECS,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RouterState>,
    pub registry: Arc<ConnectionRegistry>,
    pub cache: Arc<CacheManager>,
    pub bridge: Arc<ExecutionBridge>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    collaborators: Collaborators,
) -> Result<ServerHandle, BridgeError> {
    let cache = Arc::new(CacheManager::new(config.default_cache_ttl_secs)?);
    let registry = Arc::new(ConnectionRegistry::new(
        config.queue_capacity,
        config.overflow_policy,
        Duration::from_secs(config.drain_timeout_secs),
    ));

    let shutdown = CancellationToken::new();
    let bridge = Arc::new(ExecutionBridge::new(
        Arc::clone(&registry),
        shutdown.clone(),
    ));

    let router_state = Arc::new(RouterState {
        registry: Arc::clone(&registry),
        cache: Arc::clone(&cache),
        bridge: Arc::clone(&bridge),
        pending: Arc::new(PendingInputs::new()),
        collaborators,
    });

    // Dead-connection cleanup task (every 60s)
    let cleanup_registry = Arc::clone(&registry);
    let cleanup_bridge = Arc::clone(&bridge);
    let _cleanup = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let removed = reap_dead_connections(&cleanup_registry, &cleanup_bridge);
            if removed > 0 {
                tracing::info!(removed = removed, "Dead connection cleanup");
            }
        }
    });

    // Inbound frame channel
    let (msg_tx, msg_rx) = mpsc::channel::<(ConnectionId, String)>(1024);

    let processor_state = Arc::clone(&router_state);
    let processor_handle = tokio::spawn(process_messages(msg_rx, processor_state));

    let app_registry = Arc::clone(&registry);
    let app_state = AppState {
        router: router_state,
        registry,
        cache,
        bridge,
        message_tx: msg_tx,
    };

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Transport(e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| BridgeError::Transport(e.to_string()))?;

    tracing::info!(port = local_addr.port(), "Bridge server started");

    let serve_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(serve_shutdown.cancelled_owned())
            .await
            .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        registry: app_registry,
        _server: server_handle,
        _processor: processor_handle,
        _cleanup,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    _server: tokio::task::JoinHandle<()>,
    _processor: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Begin shutdown: in-flight walkers abort before their next chunk, the
    /// listener stops accepting connections, and every live connection gets
    /// its bounded queue drain before the transport closes.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.close_all().await;
    }
}

/// Drop dead connections along with any walkers they left suspended.
fn reap_dead_connections(registry: &ConnectionRegistry, bridge: &ExecutionBridge) -> usize {
    let dead = registry.cleanup_dead_connections();
    for id in &dead {
        if bridge.discard(id) {
            tracing::debug!(connection_id = %id, "Discarded suspended walker for dead connection");
        }
    }
    dead.len()
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection until it closes.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.registry.register();
    tracing::info!(connection_id = %connection_id, "Connection opened");

    connection::handle_ws_connection(
        socket,
        connection_id.clone(),
        rx,
        Arc::clone(&state.registry),
        state.message_tx.clone(),
    )
    .await;

    // A walker suspended at a gate would leak with its connection gone.
    if state.bridge.discard(&connection_id) {
        tracing::debug!(connection_id = %connection_id, "Discarded suspended walker on close");
    }
    tracing::info!(connection_id = %connection_id, "Connection closed");
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.registry.count(),
        "suspended_walkers": state.bridge.suspended_count(),
        "query_cache": state.cache.stats(),
    }))
}

/// Drive the router over the inbound frame channel. Each frame is handled
/// on its own task so a slow collaborator call cannot stall routing for
/// other connections.
async fn process_messages(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    state: Arc<RouterState>,
) {
    while let Some((connection_id, raw)) = rx.recv().await {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            state.handle_frame(&connection_id, &raw).await;
        });
    }
}
