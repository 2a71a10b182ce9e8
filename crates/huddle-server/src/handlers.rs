//! HTTP and WebSocket handlers for the Huddle server.
//!
//! Room creation and lookup are plain JSON routes over the directory. Each
//! WebSocket upgrade becomes one [`Session`] bound to the room and display
//! name taken from its path.

use crate::config::{Config, DirectoryBackend, DirectoryConfig};
use crate::error::ApiError;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::store::SqliteDirectory;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, Path, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use huddle_core::{
    CloseReason, Directory, InMemoryDirectory, Registry, RoomCode, RoomCodeGenerator, Session,
    SessionConfig, SessionError, SessionOutcome,
};
use huddle_transport::{Connection, WebSocketConnection};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// How often registry gauges are refreshed.
const REGISTRY_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    /// Live room membership.
    pub registry: Arc<Registry>,
    /// Known room codes.
    pub directory: Arc<dyn Directory>,
    /// Server configuration.
    pub config: Config,
    connections: Arc<Semaphore>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, directory: Arc<dyn Directory>) -> Self {
        let permits = config.limits.max_connections.min(Semaphore::MAX_PERMITS);

        Self {
            registry: Arc::new(Registry::new()),
            directory,
            connections: Arc::new(Semaphore::new(permits)),
            config,
        }
    }
}

/// Body of the room routes.
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomCodeResponse {
    /// The room code.
    pub code: RoomCode,
}

/// Open the directory backend named in the configuration.
///
/// # Errors
///
/// Returns an error if the SQLite database cannot be opened.
pub fn open_directory(config: &DirectoryConfig) -> Result<Arc<dyn Directory>> {
    let generator = RoomCodeGenerator::new(config.code_length);

    match config.backend {
        DirectoryBackend::Memory => {
            warn!("Using in-memory room directory; rooms are lost on restart");
            Ok(Arc::new(InMemoryDirectory::with_generator(generator)))
        }
        DirectoryBackend::Sqlite => {
            let path = shellexpand::tilde(&config.database_path).into_owned();
            let directory = SqliteDirectory::open(&path, generator)
                .with_context(|| format!("Failed to open room directory {}", path))?;
            Ok(Arc::new(directory))
        }
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_route = format!(
        "{}/:room_code/:username",
        state.config.transport.websocket_path.trim_end_matches('/')
    );

    Router::new()
        .route("/create_room", post(create_room))
        .route("/check_room/:code", get(check_room))
        .route(&ws_route, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the directory cannot be opened or the server fails
/// to start.
pub async fn run_server(config: Config) -> Result<()> {
    let directory = open_directory(&config.directory)?;
    let state = Arc::new(AppState::new(config.clone(), directory));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(report_registry(state.registry.clone()));
    }

    let app = build_router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}/{{room_code}}/{{username}}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Huddle server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn report_registry(registry: Arc<Registry>) {
    let mut ticker = tokio::time::interval(REGISTRY_REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        metrics::record_registry(&registry.stats());
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": stats.room_count,
        "members": stats.member_count,
    }))
}

/// Allocate a new room code.
async fn create_room(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoomCodeResponse>, ApiError> {
    let code = state.directory.create().await?;
    metrics::record_room_created();
    info!(room = %code, "Room created");
    Ok(Json(RoomCodeResponse { code }))
}

/// Report whether a room code exists.
async fn check_room(
    Path(code): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoomCodeResponse>, ApiError> {
    if state.directory.exists(&code).await? {
        Ok(Json(RoomCodeResponse { code }))
    } else {
        Err(ApiError::RoomNotFound)
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((room_code, username)): Path<(String, String)>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let permit = state.connections.clone().try_acquire_owned().map_err(|_| {
        metrics::record_error("connection_limit");
        ApiError::Unavailable("Connection limit reached".to_string())
    })?;
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    Ok(ws
        .max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| {
            handle_websocket(socket, room_code, username, remote_addr, state, permit)
        }))
}

/// Run one session over an upgraded socket.
async fn handle_websocket(
    socket: WebSocket,
    room_code: String,
    username: String,
    remote_addr: Option<SocketAddr>,
    state: Arc<AppState>,
    _permit: OwnedSemaphorePermit,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut conn = WebSocketConnection::new(socket);
    if let Some(addr) = remote_addr {
        conn = conn.with_remote_addr(addr);
    }
    debug!(
        connection = %conn.id(),
        room = %room_code,
        remote = ?conn.remote_addr(),
        "WebSocket connected"
    );

    let session = Session::new(
        room_code,
        username,
        state.registry.clone(),
        state.directory.clone(),
    )
    .with_config(SessionConfig {
        outbound_capacity: state.config.limits.outbound_queue_capacity,
    });

    match session.run(&mut conn).await {
        SessionOutcome::Rejected(e) => {
            if matches!(e, SessionError::Directory(_)) {
                metrics::record_error("directory");
            }
            metrics::record_rejected(&e);
        }
        SessionOutcome::Ended { reason, stats } => {
            if matches!(
                reason,
                CloseReason::ReceiveError(_) | CloseReason::SendFailure(_)
            ) {
                metrics::record_error("websocket");
            }
            metrics::record_session_end(&reason, &stats);
        }
    }
    metrics::record_registry(&state.registry.stats());

    debug!(connection = %conn.id(), "WebSocket disconnected");
}
