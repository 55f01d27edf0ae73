use std::{collections::HashMap, env, sync::Arc};

use chrono::{DateTime, Utc};
use common_net::{
    metrics::{self, SessionMetrics},
    shutdown,
};
use pocketbase::PocketBaseClient;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

pub type BoxError = metrics::BoxError;

const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:3200";
const DEFAULT_POCKETBASE_URL: &str = "http://localhost:8090";

pub const METRICS_PATH: &str = "/metrics";
pub const SESSIONS_COLLECTION: &str = "sessions";

/// Lifecycle of a broadcast session. Transitions only move forward:
/// `Created -> Live -> Ended -> Recorded`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Live,
    Ended,
    Recorded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub description: String,
    pub host_user_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub recording_path: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("only the host may change the session lifecycle")]
    Unauthorized,
    #[error("session is already live or has ended")]
    AlreadyLiveOrEnded,
    #[error("session record vanished before the recording could be attached")]
    SessionMissing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub title: String,
    pub description: String,
    pub host_user_id: String,
}

/// Authoritative in-memory session registry. Every mutation is mirrored to
/// the PocketBase `sessions` collection best-effort; a storage failure is
/// logged and never blocks the hub.
#[derive(Debug)]
pub struct SessionManagerState {
    pub sessions: HashMap<String, Session>,
    pub pocketbase: PocketBaseClient,
}

pub type SharedSessions = Arc<RwLock<SessionManagerState>>;

impl SessionManagerState {
    pub fn new(pocketbase_url: &str) -> Self {
        Self {
            sessions: HashMap::new(),
            pocketbase: PocketBaseClient::new(pocketbase_url),
        }
    }

    pub fn shared(pocketbase_url: &str) -> SharedSessions {
        Arc::new(RwLock::new(Self::new(pocketbase_url)))
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn live_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Live)
            .count()
    }

    pub async fn create_session(&mut self, req: CreateSessionRequest) -> Session {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            title: req.title,
            description: req.description,
            host_user_id: req.host_user_id,
            state: SessionState::Created,
            created_at: Utc::now(),
            recording_path: None,
            recorded_at: None,
        };

        let record = serde_json::json!({
            "id": session.id,
            "title": session.title,
            "description": session.description,
            "host_user_id": session.host_user_id,
            "state": session.state,
            "created_at": session.created_at,
        });
        if let Err(err) = self
            .pocketbase
            .create_record(SESSIONS_COLLECTION, record)
            .await
        {
            warn!(%err, session_id = %session.id, "session mirror create failed");
        }

        session_metrics().inc_sessions_created();
        info!(session_id = %session.id, host = %session.host_user_id, "session created");

        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// `Created -> Live`. Host only; a second attempt (or one after the end)
    /// fails instead of silently rewinding the lifecycle.
    pub async fn go_live(
        &mut self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Session, SessionError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(SessionError::NotFound)?;
        if session.host_user_id != user_id {
            return Err(SessionError::Unauthorized);
        }
        if session.state != SessionState::Created {
            return Err(SessionError::AlreadyLiveOrEnded);
        }

        session.state = SessionState::Live;
        let snapshot = session.clone();
        self.mirror_state(&snapshot).await;

        info!(session_id, "session is now live");
        Ok(snapshot)
    }

    /// `Live -> Ended` (and `Created -> Ended` for a broadcast cancelled
    /// before going live, which is what the end request historically did).
    /// Idempotent: ending an already-ended session reports `newly_ended =
    /// false` so assembly is scheduled exactly once per session.
    pub async fn end_session(
        &mut self,
        session_id: &str,
        user_id: &str,
    ) -> Result<EndOutcome, SessionError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(SessionError::NotFound)?;
        if session.host_user_id != user_id {
            return Err(SessionError::Unauthorized);
        }

        match session.state {
            SessionState::Ended | SessionState::Recorded => Ok(EndOutcome {
                session: session.clone(),
                newly_ended: false,
            }),
            SessionState::Created | SessionState::Live => {
                session.state = SessionState::Ended;
                let snapshot = session.clone();
                self.mirror_state(&snapshot).await;

                info!(session_id, "session ended");
                Ok(EndOutcome {
                    session: snapshot,
                    newly_ended: true,
                })
            }
        }
    }

    /// `Ended -> Recorded`. The assembly worker is the only caller; it runs
    /// after the end request already returned, so a missing session is
    /// reported instead of surfaced to a user.
    pub async fn mark_recorded(
        &mut self,
        session_id: &str,
        recording_path: &str,
    ) -> Result<Session, SessionError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(SessionError::SessionMissing)?;

        if session.state == SessionState::Recorded {
            // A retried job after a lost ack; the recording is already attached.
            return Ok(session.clone());
        }

        session.state = SessionState::Recorded;
        session.recording_path = Some(recording_path.to_string());
        session.recorded_at = Some(Utc::now());
        let snapshot = session.clone();
        self.mirror_state(&snapshot).await;

        session_metrics().inc_sessions_recorded();
        info!(session_id, recording_path, "session recorded");
        Ok(snapshot)
    }

    async fn mirror_state(&self, session: &Session) {
        let patch = serde_json::json!({
            "state": session.state,
            "recording_path": session.recording_path,
            "recorded_at": session.recorded_at,
        });
        if let Err(err) = self
            .pocketbase
            .update_record(SESSIONS_COLLECTION, &session.id, patch)
            .await
        {
            warn!(%err, session_id = %session.id, "session mirror update failed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndOutcome {
    pub session: Session,
    pub newly_ended: bool,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SessionManagerSettings {
    pub metrics_addr: std::net::SocketAddr,
    pub pocketbase_url: String,
}

impl SessionManagerSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let metrics_addr = env::var("SESSION_MANAGER_METRICS_ADDR")
            .unwrap_or_else(|_| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr = metrics_addr
            .parse()
            .map_err(|err| Box::new(err) as BoxError)?;
        let pocketbase_url =
            env::var("POCKETBASE_URL").unwrap_or_else(|_| DEFAULT_POCKETBASE_URL.to_string());
        Ok(Self {
            metrics_addr,
            pocketbase_url,
        })
    }
}

impl Default for SessionManagerSettings {
    fn default() -> Self {
        Self {
            metrics_addr: DEFAULT_METRICS_ADDR
                .parse()
                .expect("default session-manager metrics addr"),
            pocketbase_url: DEFAULT_POCKETBASE_URL.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct SessionManagerConfig {
    pub metrics_addr: std::net::SocketAddr,
    pub pocketbase_url: String,
    pub ready_tx: Option<oneshot::Sender<std::net::SocketAddr>>,
}

impl SessionManagerConfig {
    pub fn from_settings(settings: SessionManagerSettings) -> Self {
        Self {
            metrics_addr: settings.metrics_addr,
            pocketbase_url: settings.pocketbase_url,
            ready_tx: None,
        }
    }

    pub fn from_env() -> Result<Self, BoxError> {
        SessionManagerSettings::from_env().map(Self::from_settings)
    }
}

pub fn session_metrics() -> &'static SessionMetrics {
    metrics::session_metrics()
}

pub async fn run_with_ctrl_c(config: SessionManagerConfig) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let ctrl_c = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "session-manager: could not listen for ctrl_c");
        }
        shutdown::trigger(&shutdown_tx);
    });

    let sessions = SessionManagerState::shared(&config.pocketbase_url);
    let result = run(config, sessions, shutdown_rx).await;

    ctrl_c.abort();
    result
}

/// Serve the session metric set and keep the live-session gauge fresh.
pub async fn run(
    config: SessionManagerConfig,
    sessions: SharedSessions,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    session_metrics().on_startup();

    let listener = tokio::net::TcpListener::bind(config.metrics_addr)
        .await
        .map_err(|err| Box::new(err) as BoxError)?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| Box::new(err) as BoxError)?;

    if let Some(tx) = config.ready_tx {
        let _ = tx.send(local_addr);
    }

    info!(%local_addr, path = METRICS_PATH, "session-manager metrics exporter listening");

    let gauge_sessions = sessions.clone();
    let gauge_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            let state = gauge_sessions.read().await;
            session_metrics().set_live_sessions(state.live_count() as i64);
        }
    });

    let server = tokio::spawn(async move {
        if let Err(err) = metrics::serve_metrics(listener, METRICS_PATH).await {
            error!(%err, "session-manager metrics exporter stopped unexpectedly");
        }
    });

    shutdown::wait(shutdown_rx).await;
    info!("session-manager shutting down");

    gauge_task.abort();
    server.abort();

    Ok(())
}
