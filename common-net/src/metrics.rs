use std::net::SocketAddr;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use once_cell::sync::OnceCell;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Metric set for the gateway relay path.
pub struct SignalingMetrics {
    pub connected_endpoints: IntGauge,
    pub signals_relayed_total: IntCounter,
    pub chat_messages_total: IntCounter,
    pub members_evicted_total: IntCounter,
}

impl SignalingMetrics {
    pub fn on_startup(&self) {
        self.connected_endpoints.set(0);
        self.signals_relayed_total.inc_by(0);
    }

    pub fn inc_signals_relayed(&self, delta: u64) {
        self.signals_relayed_total.inc_by(delta);
    }

    pub fn inc_chat_messages(&self) {
        self.chat_messages_total.inc();
    }

    pub fn inc_members_evicted(&self) {
        self.members_evicted_total.inc();
    }
}

/// Metric set for the session lifecycle.
pub struct SessionMetrics {
    pub sessions_created_total: IntCounter,
    pub live_sessions: IntGauge,
    pub sessions_recorded_total: IntCounter,
}

impl SessionMetrics {
    pub fn on_startup(&self) {
        self.sessions_created_total.inc_by(0);
        self.live_sessions.set(0);
    }

    pub fn inc_sessions_created(&self) {
        self.sessions_created_total.inc();
    }

    pub fn set_live_sessions(&self, live: i64) {
        self.live_sessions.set(live);
    }

    pub fn inc_sessions_recorded(&self) {
        self.sessions_recorded_total.inc();
    }
}

/// Metric set for the recording assembly worker.
pub struct AssemblyMetrics {
    pub jobs_started_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub fragments_merged_total: IntCounter,
    pub assembly_duration_seconds: Histogram,
}

impl AssemblyMetrics {
    pub fn on_startup(&self) {
        self.jobs_started_total.inc_by(0);
        self.jobs_failed_total.inc_by(0);
    }

    pub fn inc_jobs_started(&self) {
        self.jobs_started_total.inc();
    }

    pub fn inc_jobs_failed(&self) {
        self.jobs_failed_total.inc();
    }

    pub fn inc_fragments_merged(&self, fragments: u64) {
        self.fragments_merged_total.inc_by(fragments);
    }

    pub fn observe_assembly_seconds(&self, seconds: f64) {
        self.assembly_duration_seconds.observe(seconds);
    }
}

static SIGNALING_METRICS: OnceCell<SignalingMetrics> = OnceCell::new();
static SESSION_METRICS: OnceCell<SessionMetrics> = OnceCell::new();
static ASSEMBLY_METRICS: OnceCell<AssemblyMetrics> = OnceCell::new();

pub fn signaling_metrics() -> &'static SignalingMetrics {
    SIGNALING_METRICS.get_or_init(|| SignalingMetrics {
        connected_endpoints: register_int_gauge!(
            "gateway_connected_endpoints",
            "Endpoints currently attached to a session group"
        )
        .expect("register gateway_connected_endpoints"),
        signals_relayed_total: register_int_counter!(
            "gateway_signals_relayed_total",
            "Signaling messages fanned out to group members"
        )
        .expect("register gateway_signals_relayed_total"),
        chat_messages_total: register_int_counter!(
            "gateway_chat_messages_total",
            "Chat messages broadcast through the relay"
        )
        .expect("register gateway_chat_messages_total"),
        members_evicted_total: register_int_counter!(
            "gateway_members_evicted_total",
            "Group members evicted after a failed delivery"
        )
        .expect("register gateway_members_evicted_total"),
    })
}

pub fn session_metrics() -> &'static SessionMetrics {
    SESSION_METRICS.get_or_init(|| SessionMetrics {
        sessions_created_total: register_int_counter!(
            "session_manager_sessions_created_total",
            "Sessions created by the session manager"
        )
        .expect("register session_manager_sessions_created_total"),
        live_sessions: register_int_gauge!(
            "session_manager_live_sessions",
            "Sessions currently live"
        )
        .expect("register session_manager_live_sessions"),
        sessions_recorded_total: register_int_counter!(
            "session_manager_sessions_recorded_total",
            "Sessions that reached the recorded state"
        )
        .expect("register session_manager_sessions_recorded_total"),
    })
}

pub fn assembly_metrics() -> &'static AssemblyMetrics {
    ASSEMBLY_METRICS.get_or_init(|| AssemblyMetrics {
        jobs_started_total: register_int_counter!(
            "assembler_jobs_started_total",
            "Assembly jobs picked up by the worker pool"
        )
        .expect("register assembler_jobs_started_total"),
        jobs_failed_total: register_int_counter!(
            "assembler_jobs_failed_total",
            "Assembly jobs that ended with a fatal error"
        )
        .expect("register assembler_jobs_failed_total"),
        fragments_merged_total: register_int_counter!(
            "assembler_fragments_merged_total",
            "Fragments folded into finished recordings"
        )
        .expect("register assembler_fragments_merged_total"),
        assembly_duration_seconds: register_histogram!(
            "assembler_assembly_duration_seconds",
            "Wall time of one assembly job (seconds)",
            vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("register assembler_assembly_duration_seconds"),
    })
}

pub fn metrics_router(metrics_path: &'static str) -> Router {
    Router::new().route(metrics_path, get(metrics_handler))
}

pub async fn serve_metrics(
    listener: TcpListener,
    metrics_path: &'static str,
) -> Result<(), BoxError> {
    let router = metrics_router(metrics_path);
    axum::serve(listener, router)
        .await
        .map_err(|err| Box::new(err) as BoxError)
}

pub fn spawn_metrics_exporter(
    addr: SocketAddr,
    metrics_path: &'static str,
    service_name: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = serve_metrics(listener, metrics_path).await {
                    error!(%err, service = service_name, %addr, path = metrics_path, "metrics exporter stopped unexpectedly");
                }
            }
            Err(err) => {
                error!(%err, service = service_name, %addr, path = metrics_path, "metrics exporter could not bind");
            }
        }
    })
}

async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(%err, "metrics: encode failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let body = match String::from_utf8(buffer) {
        Ok(text) => text,
        Err(err) => {
            error!(%err, "metrics: invalid UTF-8 in exposition");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(body))
    {
        Ok(response) => response,
        Err(err) => {
            error!(%err, "metrics: response build failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
