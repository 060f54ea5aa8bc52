use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Local;
use futures_util::StreamExt;
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    env,
    fs::OpenOptions,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use streamrelay_server::commands::{
    get_platforms, get_quality_presets, get_relay_log, preview_relay_config, resolve_relay_config,
    test_ffmpeg, test_ingest_server, test_relay_config, test_rtmp_target,
};
use streamrelay_server::models::{RelayConfig, Settings};
use streamrelay_server::services::{
    prune_logs, read_recent_logs, BinaryLocator, ControllerError, ControllerOptions, EventSink,
    PlatformCatalog, RelayController, SettingsManager, LOG_RING_CAPACITY,
};
use subtle::ConstantTimeEq;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, CorsLayer};

// ============================================================================
// Constants
// ============================================================================

const LOG_FILE_NAME: &str = "streamrelay-server.log";
const CATALOG_FILE_NAME: &str = "platforms.json";
const DEFAULT_API_PORT: u16 = 8010;
const DEFAULT_LOG_LINES: usize = 200;

// ============================================================================
// Event System
// ============================================================================

#[derive(Clone, Serialize)]
struct ServerEvent {
    event: String,
    payload: Value,
}

#[derive(Clone)]
struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &str, payload: Value) {
        let _ = self.sender.send(ServerEvent {
            event: event.to_string(),
            payload,
        });
    }
}

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
struct AppState {
    controller: Arc<RelayController>,
    settings_manager: Arc<SettingsManager>,
    event_bus: EventBus,
    log_dir: PathBuf,
    auth_token: Option<String>,
}

#[derive(Serialize)]
struct InvokeResponse {
    ok: bool,
    data: Option<Value>,
    error: Option<String>,
}

fn ok_response<T: Serialize>(data: T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => {
            let response = InvokeResponse {
                ok: true,
                data: Some(value),
                error: None,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to serialize response: {e}")),
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    let response = InvokeResponse {
        ok: false,
        data: None,
        error: Some(error),
    };
    (status, Json(response)).into_response()
}

fn controller_error_status(error: &ControllerError) -> StatusCode {
    match error {
        ControllerError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ControllerError::AlreadyRunning | ControllerError::NotRunning => StatusCode::CONFLICT,
        ControllerError::Render(_) | ControllerError::Supervisor(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Empty body means "use saved settings"
fn parse_optional_body<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| format!("Invalid request body: {e}"))
}

// ============================================================================
// Logging
// ============================================================================

struct ServerLogger {
    file: Mutex<std::fs::File>,
    event_bus: EventBus,
    level: LevelFilter,
}

impl ServerLogger {
    fn new(log_dir: &Path, event_bus: EventBus) -> Result<Self, Box<dyn std::error::Error>> {
        let log_path = log_dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            file: Mutex::new(file),
            event_bus,
            level: LevelFilter::Info,
        })
    }
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        let message = PlatformCatalog::redact_line(&record.args().to_string());
        let line = format!("[{date}][{time}][{target}][{level}] {message}");

        if let Ok(mut file) = self.file.try_lock() {
            let _ = writeln!(file, "{line}");
        }

        let level_number = match level {
            Level::Error => 1,
            Level::Warn => 2,
            Level::Info => 3,
            Level::Debug => 4,
            Level::Trace => 5,
        };

        self.event_bus.emit(
            "log://log",
            json!({ "level": level_number, "message": message, "target": target }),
        );
    }

    fn flush(&self) {}
}

fn init_logger(log_dir: &Path, event_bus: EventBus) -> Result<(), Box<dyn std::error::Error>> {
    let logger = ServerLogger::new(log_dir, event_bus)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

// ============================================================================
// Security Utilities
// ============================================================================

/// Constant-time token comparison to prevent timing attacks
fn verify_token(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Extract bearer token from Authorization header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(request).await;
    };

    if bearer_token(&headers).is_some_and(|token| verify_token(expected, token)) {
        return next.run(request).await;
    }

    error_response(StatusCode::UNAUTHORIZED, "Authentication required".to_string())
}

// ============================================================================
// CORS Configuration
// ============================================================================

fn build_cors_layer() -> CorsLayer {
    let cors_origins = env::var("STREAMRELAY_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:*,http://127.0.0.1:*".to_string());

    let allowed_origins: Vec<String> = cors_origins
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            allowed_origins.iter().any(|allowed| match allowed.strip_suffix(":*") {
                Some(prefix) => {
                    origin_str.starts_with(prefix) && origin_str[prefix.len()..].starts_with(':')
                }
                None => origin_str == allowed,
            })
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn relay_status_handler(State(state): State<AppState>) -> Response {
    ok_response(state.controller.status())
}

async fn relay_start_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let config = match parse_optional_body::<RelayConfig>(&body)
        .and_then(|config| resolve_relay_config(&state.settings_manager, config))
    {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.controller.start(config).await {
        Ok(session) => ok_response(session),
        Err(e) => error_response(controller_error_status(&e), e.to_string()),
    }
}

async fn relay_stop_handler(State(state): State<AppState>) -> Response {
    state.controller.stop().await;
    ok_response(state.controller.status())
}

async fn relay_restart_handler(State(state): State<AppState>) -> Response {
    match state.controller.restart().await {
        Ok(session) => ok_response(session),
        Err(e) => error_response(controller_error_status(&e), e.to_string()),
    }
}

#[derive(Deserialize)]
struct TestQuery {
    /// Also open a TCP connection to every destination
    #[serde(default)]
    probe: bool,
}

async fn relay_test_handler(
    State(state): State<AppState>,
    Query(query): Query<TestQuery>,
    body: Bytes,
) -> Response {
    let config = match parse_optional_body::<RelayConfig>(&body) {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let summaries = match test_relay_config(&state.controller, &state.settings_manager, config) {
        Ok(summaries) => summaries,
        Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    };

    if !query.probe {
        return ok_response(json!({ "pipelines": summaries }));
    }

    let destinations: Vec<String> = summaries.iter().map(|s| s.destination.clone()).collect();
    let probes = tokio::task::spawn_blocking(move || {
        destinations.iter().map(|url| test_rtmp_target(url)).collect::<Vec<_>>()
    })
    .await;

    match probes {
        Ok(probes) => ok_response(json!({ "pipelines": summaries, "probes": probes })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Probe task failed: {e}")),
    }
}

async fn relay_preview_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let config = match parse_optional_body::<RelayConfig>(&body) {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match preview_relay_config(&state.controller, &state.settings_manager, config) {
        Ok(text) => ok_response(text),
        Err(e) => error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

#[derive(Deserialize)]
struct LinesQuery {
    lines: Option<usize>,
}

async fn relay_log_handler(State(state): State<AppState>, Query(query): Query<LinesQuery>) -> Response {
    let lines = query.lines.unwrap_or(LOG_RING_CAPACITY);
    let rendered: Vec<String> = get_relay_log(&state.controller, lines)
        .iter()
        .map(ToString::to_string)
        .collect();
    ok_response(rendered)
}

async fn platforms_handler(State(state): State<AppState>) -> Response {
    ok_response(get_platforms(&state.controller))
}

async fn presets_handler() -> Response {
    ok_response(get_quality_presets())
}

async fn get_settings_handler(State(state): State<AppState>) -> Response {
    match state.settings_manager.load() {
        Ok(settings) => ok_response(settings),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn save_settings_handler(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> Response {
    match state.settings_manager.save(&settings) {
        Ok(()) => {
            log::info!("Settings saved");
            ok_response(settings)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn server_logs_handler(State(state): State<AppState>, Query(query): Query<LinesQuery>) -> Response {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    match read_recent_logs(&state.log_dir, lines) {
        Ok(lines) => ok_response(lines),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn ingest_check_handler(State(state): State<AppState>) -> Response {
    let ingest_binary = state.controller.options().ingest_binary.clone();
    let result = tokio::task::spawn_blocking(move || {
        test_ingest_server(&BinaryLocator::nginx().with_explicit(Some(ingest_binary)))
    })
    .await;

    match result {
        Ok(Ok(info)) => ok_response(info),
        Ok(Err(e)) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Check task failed: {e}")),
    }
}

async fn ffmpeg_check_handler(State(state): State<AppState>) -> Response {
    let ffmpeg = PathBuf::from(&state.controller.options().ffmpeg_binary);
    let result = tokio::task::spawn_blocking(move || test_ffmpeg(&ffmpeg)).await;

    match result {
        Ok(Ok(version)) => ok_response(version),
        Ok(Err(e)) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Check task failed: {e}")),
    }
}

#[derive(Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // Browsers cannot set headers on websocket upgrades, so a query token is accepted too
    let authenticated = state.auth_token.as_deref().map_or(true, |expected| {
        bearer_token(&headers).is_some_and(|token| verify_token(expected, token))
            || query.token.as_deref().is_some_and(|token| verify_token(expected, token))
    });

    if !authenticated {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state.event_bus.subscribe()))
}

async fn handle_socket(mut socket: WebSocket, receiver: broadcast::Receiver<ServerEvent>) {
    let mut events = BroadcastStream::new(receiver);
    while let Some(event) = events.next().await {
        // Lagged receivers skip ahead instead of disconnecting
        let Ok(event) = event else { continue };
        if let Ok(payload) = serde_json::to_string(&event) {
            if socket.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    }
}

// ============================================================================
// Startup
// ============================================================================

fn parse_host(host: &str) -> IpAddr {
    host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

fn load_catalog(data_dir: &Path) -> PlatformCatalog {
    let path = data_dir.join(CATALOG_FILE_NAME);
    PlatformCatalog::load(&path).unwrap_or_else(|e| {
        log::warn!("Ignoring platform overrides in {path:?}: {e}");
        PlatformCatalog::builtin()
    })
}

/// Graceful shutdown signal handler
/// Waits for Ctrl+C or SIGTERM, then stops the relay
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received, stopping relay...");
    state.controller.stop().await;
    log::info!("Relay stopped, server shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = absolute(PathBuf::from(
        env::var("STREAMRELAY_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
    ));
    let log_dir = env::var("STREAMRELAY_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("logs"));
    let conf_dir = absolute(
        env::var("STREAMRELAY_CONF_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("nginx")),
    );

    let host = env::var("STREAMRELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("STREAMRELAY_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_API_PORT);
    let auth_token = env::var("STREAMRELAY_API_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(&log_dir)?;
    std::fs::create_dir_all(&conf_dir)?;

    let event_bus = EventBus::new();
    init_logger(&log_dir, event_bus.clone())?;
    log::info!("Data directory: {data_dir:?}, ingest config directory: {conf_dir:?}");

    let settings_manager = Arc::new(SettingsManager::new(&data_dir));
    match settings_manager.load() {
        Ok(settings) => {
            if let Err(e) = prune_logs(&log_dir, settings.general.log_retention_days) {
                log::warn!("Log pruning failed: {e}");
            }
        }
        Err(e) => log::warn!("Failed to load settings, defaults will be used on start: {e}"),
    }

    let ingest_binary = BinaryLocator::nginx().find_or_default();
    let ffmpeg_binary = BinaryLocator::ffmpeg().find_or_default();
    log::info!("Ingest server: {ingest_binary:?}, transcoder: {ffmpeg_binary:?}");

    let mut options = ControllerOptions::new(conf_dir, ingest_binary);
    options.ffmpeg_binary = ffmpeg_binary.display().to_string();

    let event_sink: Arc<dyn EventSink> = Arc::new(event_bus.clone());
    let controller = Arc::new(RelayController::new(load_catalog(&data_dir), options, event_sink));

    let state = AppState {
        controller,
        settings_manager,
        event_bus,
        log_dir,
        auth_token,
    };

    // Protected routes (require authentication)
    let protected_routes = Router::new()
        .route("/api/relay/status", get(relay_status_handler))
        .route("/api/relay/start", post(relay_start_handler))
        .route("/api/relay/stop", post(relay_stop_handler))
        .route("/api/relay/restart", post(relay_restart_handler))
        .route("/api/relay/test", post(relay_test_handler))
        .route("/api/relay/preview", get(relay_preview_handler).post(relay_preview_handler))
        .route("/api/relay/log", get(relay_log_handler))
        .route("/api/platforms", get(platforms_handler))
        .route("/api/presets", get(presets_handler))
        .route("/api/settings", get(get_settings_handler).post(save_settings_handler))
        .route("/api/logs", get(server_logs_handler))
        .route("/api/system/ingest", get(ingest_check_handler))
        .route("/api/system/ffmpeg", get(ffmpeg_check_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Public routes (no auth required); /ws checks its own token
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state.clone())
        .layer(build_cors_layer());

    let address = SocketAddr::new(parse_host(&host), port);
    log::info!("StreamRelay backend listening on http://{address}");
    if state.auth_token.is_some() {
        log::info!("  Authentication: enabled");
    } else {
        log::info!("  Authentication: disabled (no token configured)");
    }

    let listener = tokio::net::TcpListener::bind(address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}
