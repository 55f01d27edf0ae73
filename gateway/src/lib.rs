use std::{net::SocketAddr, sync::Arc};

use assembler::{AssemblyScheduler, ChunkStore, StorageError};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use pocketbase::PocketBaseClient;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};
use serde::Deserialize;
use session_manager::{CreateSessionRequest, SessionError, SharedSessions};
use tokio::sync::oneshot;
use tracing::{error, info};

pub mod polls;
pub mod registry;
pub mod relay;

use polls::PollBoard;
use registry::GroupRegistry;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const HEALTHZ_PATH: &str = "/healthz";
pub const VERSION_PATH: &str = "/version";
pub const METRICS_PATH: &str = "/metrics";

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_http_requests_total",
        "HTTP requests per route",
        &["path"]
    )
    .expect("register gateway_http_requests_total")
});

/// Everything a request handler can reach. Cheap to clone; all fields are
/// handles onto shared state.
#[derive(Clone)]
pub struct HubState {
    pub sessions: SharedSessions,
    pub groups: Arc<GroupRegistry>,
    pub polls: Arc<PollBoard>,
    pub chunks: ChunkStore,
    pub scheduler: AssemblyScheduler,
    pub pocketbase: PocketBaseClient,
}

impl HubState {
    pub fn new(
        sessions: SharedSessions,
        chunks: ChunkStore,
        scheduler: AssemblyScheduler,
        pocketbase: PocketBaseClient,
    ) -> Self {
        Self {
            sessions,
            groups: Arc::new(GroupRegistry::new()),
            polls: Arc::new(PollBoard::new()),
            chunks,
            scheduler,
            pocketbase,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct GatewaySettings {
    pub bind_addr: SocketAddr,
    pub pocketbase_url: String,
}

impl GatewaySettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let bind_addr: SocketAddr = std::env::var("GATEWAY_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|e| Box::new(e) as BoxError)?;
        let pocketbase_url = std::env::var("POCKETBASE_URL")
            .unwrap_or_else(|_| "http://localhost:8090".to_string());
        Ok(Self {
            bind_addr,
            pocketbase_url,
        })
    }
}

#[derive(Debug)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub ready_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl GatewayConfig {
    pub fn from_settings(settings: GatewaySettings) -> Self {
        Self {
            bind_addr: settings.bind_addr,
            ready_tx: None,
        }
    }

    pub fn from_env() -> Result<Self, BoxError> {
        GatewaySettings::from_env().map(Self::from_settings)
    }
}

pub fn build_router(state: HubState) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(VERSION_PATH, get(version))
        .route(METRICS_PATH, get(metrics))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/start", post(start_session))
        .route("/sessions/:id/end", post(end_session))
        .route("/sessions/:id/chunks/:index", post(upload_chunk))
        .route("/ws/:session_id", get(relay::ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[HEALTHZ_PATH]).inc();
    StatusCode::OK
}

async fn version() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[VERSION_PATH]).inc();
    let body = serde_json::json!({
        "name": "gateway",
        "version": env!("CARGO_PKG_VERSION"),
    });
    Json(body)
}

async fn metrics() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[METRICS_PATH]).inc();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(%err, "metrics encode failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics encode failed").into_response();
    }
    let body = String::from_utf8(buffer).unwrap_or_default();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
        body,
    )
        .into_response()
}

fn session_error_response(err: SessionError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        SessionError::NotFound => StatusCode::NOT_FOUND,
        SessionError::Unauthorized => StatusCode::FORBIDDEN,
        SessionError::AlreadyLiveOrEnded => StatusCode::CONFLICT,
        SessionError::SessionMissing => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}

async fn create_session(
    State(state): State<HubState>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&["/sessions"]).inc();
    let session = state.sessions.write().await.create_session(req).await;
    (StatusCode::CREATED, Json(session))
}

async fn get_session(
    State(state): State<HubState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&["/sessions/:id"]).inc();
    match state.sessions.read().await.get(&session_id) {
        Some(session) => (StatusCode::OK, Json(session.clone())).into_response(),
        None => session_error_response(SessionError::NotFound).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LifecycleRequest {
    user_id: String,
}

async fn start_session(
    State(state): State<HubState>,
    Path(session_id): Path<String>,
    Json(req): Json<LifecycleRequest>,
) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["/sessions/:id/start"])
        .inc();
    match state
        .sessions
        .write()
        .await
        .go_live(&session_id, &req.user_id)
        .await
    {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => session_error_response(err).into_response(),
    }
}

/// Ends the broadcast and hands the session to the assembly worker. The
/// response never waits for assembly; `assembly_scheduled` tells the caller
/// whether this request was the one that triggered it.
async fn end_session(
    State(state): State<HubState>,
    Path(session_id): Path<String>,
    Json(req): Json<LifecycleRequest>,
) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["/sessions/:id/end"])
        .inc();
    match state
        .sessions
        .write()
        .await
        .end_session(&session_id, &req.user_id)
        .await
    {
        Ok(outcome) => {
            if outcome.newly_ended {
                state.scheduler.schedule(&session_id);
            }
            let body = serde_json::json!({
                "session": outcome.session,
                "assembly_scheduled": outcome.newly_ended,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => session_error_response(err).into_response(),
    }
}

async fn upload_chunk(
    State(state): State<HubState>,
    Path((session_id, index)): Path<(String, u64)>,
    body: Bytes,
) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["/sessions/:id/chunks/:index"])
        .inc();

    if state.sessions.read().await.get(&session_id).is_none() {
        return session_error_response(SessionError::NotFound).into_response();
    }

    match state.chunks.write_chunk(&session_id, index, &body).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(StorageError::InvalidSessionId) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid session id" })),
        )
            .into_response(),
        Err(err) => {
            error!(%err, session_id, index, "fragment upload failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn run(
    config: GatewayConfig,
    state: HubState,
    shutdown_rx: common_net::shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| Box::new(e) as BoxError)?;
    let local_addr = listener.local_addr().map_err(|e| Box::new(e) as BoxError)?;
    if let Some(tx) = config.ready_tx {
        let _ = tx.send(local_addr);
    }
    info!(%local_addr, "gateway listening");

    common_net::metrics::signaling_metrics().on_startup();

    let app = build_router(state);
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(%err, "gateway server stopped unexpectedly");
        }
    });

    common_net::shutdown::wait(shutdown_rx).await;
    server.abort();
    Ok(())
}

pub async fn run_with_ctrl_c(config: GatewayConfig, state: HubState) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = common_net::shutdown::channel();
    let runner = tokio::spawn(run(config, state, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Box::new(e) as BoxError)?;
    info!("ctrl-c received, shutting down gateway");
    common_net::shutdown::trigger(&shutdown_tx);

    runner.await.map_err(|e| Box::new(e) as BoxError)?
}
