//! Recording assembly service: staging area for uploaded fragments and the
//! background worker pool that folds them into one recording per session.

use std::{
    collections::HashSet,
    env,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use common_net::{
    metrics::{self, AssemblyMetrics},
    shutdown,
};
use session_manager::SharedSessions;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::{error, info, warn};

pub mod job;
pub mod media;
pub mod staging;

pub use job::{assemble, AssemblyError, WaitPolicy};
pub use media::{FfmpegTool, MediaTool, MediaToolError};
pub use staging::{ChunkStore, StorageError};

pub type BoxError = metrics::BoxError;

const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:3100";
const DEFAULT_STAGING_DIR: &str = "media/temp_streams";
const DEFAULT_OUTPUT_DIR: &str = "media/recorded_streams";
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;

pub const METRICS_PATH: &str = "/metrics";

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct AssemblerSettings {
    pub metrics_addr: std::net::SocketAddr,
    pub staging_dir: String,
    pub output_dir: String,
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_concurrent_jobs: usize,
}

impl AssemblerSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let metrics_addr = env::var("ASSEMBLER_METRICS_ADDR")
            .unwrap_or_else(|_| DEFAULT_METRICS_ADDR.to_string())
            .parse()
            .map_err(|err| Box::new(err) as BoxError)?;
        let staging_dir =
            env::var("ASSEMBLER_STAGING_DIR").unwrap_or_else(|_| DEFAULT_STAGING_DIR.to_string());
        let output_dir =
            env::var("ASSEMBLER_OUTPUT_DIR").unwrap_or_else(|_| DEFAULT_OUTPUT_DIR.to_string());
        let wait_timeout_ms = env_u64("ASSEMBLER_WAIT_TIMEOUT_MS", DEFAULT_WAIT_TIMEOUT_MS)?;
        let poll_interval_ms = env_u64("ASSEMBLER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        let max_concurrent_jobs = env_u64(
            "ASSEMBLER_MAX_CONCURRENT_JOBS",
            DEFAULT_MAX_CONCURRENT_JOBS as u64,
        )? as usize;

        Ok(Self {
            metrics_addr,
            staging_dir,
            output_dir,
            wait_timeout_ms,
            poll_interval_ms,
            max_concurrent_jobs,
        })
    }
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self {
            metrics_addr: DEFAULT_METRICS_ADDR
                .parse()
                .expect("default assembler metrics addr"),
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, BoxError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|err| Box::new(err) as BoxError),
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub struct AssemblerConfig {
    pub metrics_addr: std::net::SocketAddr,
    pub staging_dir: PathBuf,
    pub output_dir: PathBuf,
    pub wait: WaitPolicy,
    pub max_concurrent_jobs: usize,
    pub ready_tx: Option<oneshot::Sender<std::net::SocketAddr>>,
}

impl AssemblerConfig {
    pub fn from_settings(settings: AssemblerSettings) -> Self {
        Self {
            metrics_addr: settings.metrics_addr,
            staging_dir: PathBuf::from(settings.staging_dir),
            output_dir: PathBuf::from(settings.output_dir),
            wait: WaitPolicy {
                timeout: Duration::from_millis(settings.wait_timeout_ms),
                poll_interval: Duration::from_millis(settings.poll_interval_ms),
            },
            max_concurrent_jobs: settings.max_concurrent_jobs.max(1),
            ready_tx: None,
        }
    }

    pub fn from_env() -> Result<Self, BoxError> {
        AssemblerSettings::from_env().map(Self::from_settings)
    }
}

/// Fire-and-forget handle used by the gateway to request assembly. The end
/// request never waits on the job itself.
#[derive(Debug, Clone)]
pub struct AssemblyScheduler {
    tx: mpsc::UnboundedSender<String>,
}

impl AssemblyScheduler {
    pub fn schedule(&self, session_id: &str) {
        if self.tx.send(session_id.to_string()).is_err() {
            error!(session_id, "assembly queue is gone; job dropped");
        }
    }
}

pub struct AssemblyQueue {
    rx: mpsc::UnboundedReceiver<String>,
}

pub fn scheduler() -> (AssemblyScheduler, AssemblyQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AssemblyScheduler { tx }, AssemblyQueue { rx })
}

pub fn assembly_metrics() -> &'static AssemblyMetrics {
    metrics::assembly_metrics()
}

/// Run the worker pool: pull session ids off the queue, keep at most one
/// run in flight per session, and bound overall concurrency by the
/// transcoding budget rather than the connection count.
pub async fn run(
    config: AssemblerConfig,
    mut queue: AssemblyQueue,
    sessions: SharedSessions,
    tool: Arc<dyn MediaTool>,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    assembly_metrics().on_startup();

    let listener = tokio::net::TcpListener::bind(config.metrics_addr)
        .await
        .map_err(|err| Box::new(err) as BoxError)?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| Box::new(err) as BoxError)?;

    if let Some(tx) = config.ready_tx {
        let _ = tx.send(local_addr);
    }

    info!(%local_addr, path = METRICS_PATH, "assembler metrics exporter listening");

    let exporter = tokio::spawn(async move {
        if let Err(err) = metrics::serve_metrics(listener, METRICS_PATH).await {
            error!(%err, "assembler metrics exporter stopped unexpectedly");
        }
    });

    let store = ChunkStore::new(config.staging_dir.clone());
    let output_dir = config.output_dir.clone();
    let wait = config.wait;
    let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut shutdown_wait = Box::pin(shutdown::wait(shutdown_rx));

    loop {
        tokio::select! {
            _ = &mut shutdown_wait => {
                info!("assembler shutting down");
                break;
            }
            maybe_session = queue.rx.recv() => {
                let Some(session_id) = maybe_session else { break };

                {
                    let mut running = in_flight.lock().await;
                    if !running.insert(session_id.clone()) {
                        warn!(session_id, "assembly already in flight; trigger ignored");
                        continue;
                    }
                }

                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let store = store.clone();
                let output_dir = output_dir.clone();
                let tool = tool.clone();
                let sessions = sessions.clone();
                let in_flight = in_flight.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    run_one(&session_id, &store, &output_dir, wait, &tool, &sessions).await;
                    in_flight.lock().await.remove(&session_id);
                });
            }
        }
    }

    exporter.abort();
    Ok(())
}

async fn run_one(
    session_id: &str,
    store: &ChunkStore,
    output_dir: &std::path::Path,
    wait: WaitPolicy,
    tool: &Arc<dyn MediaTool>,
    sessions: &SharedSessions,
) {
    assembly_metrics().inc_jobs_started();
    let started = std::time::Instant::now();

    match assemble(session_id, store, output_dir, wait, tool, sessions).await {
        Ok(output) => {
            assembly_metrics().observe_assembly_seconds(started.elapsed().as_secs_f64());
            info!(session_id, output = %output.display(), "assembly job succeeded");
        }
        Err(err) => {
            // The session stays in its ended state; a fresh trigger retries
            // from whatever fragments are still on disk.
            assembly_metrics().inc_jobs_failed();
            error!(%err, session_id, "assembly job failed");
        }
    }
}
