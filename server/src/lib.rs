use std::{fs, future::Future, path::Path, pin::Pin, sync::Arc};

use assembler::{AssemblerConfig, AssemblerSettings, FfmpegTool, MediaTool};
use common_net::shutdown;
use gateway::{GatewayConfig, GatewaySettings, HubState};
use pocketbase::PocketBaseClient;
use session_manager::{SessionManagerConfig, SessionManagerSettings, SessionManagerState};
use tokio::task::JoinSet;
use tracing::{error, info};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ServerSettings {
    pub gateway: GatewaySettings,
    pub assembler: AssemblerSettings,
    pub session_manager: SessionManagerSettings,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        Ok(Self {
            gateway: GatewaySettings::from_env()?,
            assembler: AssemblerSettings::from_env()?,
            session_manager: SessionManagerSettings::from_env()?,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let raw = fs::read_to_string(path).map_err(|err| Box::new(err) as BoxError)?;
        let settings = serde_json::from_str(&raw).map_err(|err| Box::new(err) as BoxError)?;
        Ok(settings)
    }

    pub fn into_config(self) -> ServerConfig {
        ServerConfig::from_settings(self)
    }
}

#[derive(Debug)]
pub struct ServerConfig {
    pub gateway: GatewayConfig,
    pub assembler: AssemblerConfig,
    pub session_manager: SessionManagerConfig,
}

impl ServerConfig {
    pub fn from_settings(settings: ServerSettings) -> Self {
        Self {
            gateway: GatewayConfig::from_settings(settings.gateway),
            assembler: AssemblerConfig::from_settings(settings.assembler),
            session_manager: SessionManagerConfig::from_settings(settings.session_manager),
        }
    }

    pub fn from_env() -> Result<Self, BoxError> {
        ServerSettings::from_env().map(Self::from_settings)
    }
}

pub async fn run() -> Result<(), BoxError> {
    let config = ServerConfig::from_env()?;
    run_with_ctrl_c(config).await
}

pub async fn run_with_ctrl_c(config: ServerConfig) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let ctrl_c = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "server: could not listen for ctrl_c");
        }
        shutdown::trigger(&shutdown_tx);
    });

    let result = run_with_shutdown(config, shutdown_rx).await;

    ctrl_c.abort();
    result
}

/// Supervise the three services on one runtime: the gateway hub, the
/// assembly worker pool, and the session-manager exporter. They share the
/// session registry and the assembly queue in process; the first service
/// to fail brings the rest down.
pub async fn run_with_shutdown(
    config: ServerConfig,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    let (service_shutdown_tx, service_shutdown_rx) = shutdown::channel();

    let ServerConfig {
        gateway,
        assembler,
        session_manager,
    } = config;

    let sessions = SessionManagerState::shared(&session_manager.pocketbase_url);
    let chunks = assembler::ChunkStore::new(assembler.staging_dir.clone());
    let (scheduler, queue) = assembler::scheduler();
    let tool: Arc<dyn MediaTool> = Arc::new(FfmpegTool::new());
    let hub_state = HubState::new(
        sessions.clone(),
        chunks,
        scheduler,
        PocketBaseClient::new(&session_manager.pocketbase_url),
    );

    let mut join_set: JoinSet<Result<(), BoxError>> = JoinSet::new();

    let gateway_shutdown = service_shutdown_rx.clone();
    join_set.spawn(async move { gateway::run(gateway, hub_state, gateway_shutdown).await });

    let assembler_shutdown = service_shutdown_rx.clone();
    let assembler_sessions = sessions.clone();
    join_set.spawn(async move {
        assembler::run(assembler, queue, assembler_sessions, tool, assembler_shutdown).await
    });

    let session_manager_shutdown = service_shutdown_rx;
    join_set.spawn(async move {
        session_manager::run(session_manager, sessions, session_manager_shutdown).await
    });

    let mut shutdown_future: Pin<Box<dyn Future<Output = ()> + Send>> =
        Box::pin(shutdown::wait(shutdown_rx));
    let mut service_error: Option<BoxError> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown_future => {
                info!("server: external shutdown signal received");
                shutdown::trigger(&service_shutdown_tx);
                break;
            }
            maybe_task = join_set.join_next() => {
                match maybe_task {
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(err))) => {
                        error!(%err, "server: a service exited with an error");
                        service_error = Some(err);
                        shutdown::trigger(&service_shutdown_tx);
                        break;
                    }
                    Some(Err(join_err)) => {
                        let err: BoxError = Box::new(join_err);
                        error!(%err, "server: a service task panicked");
                        service_error = Some(err);
                        shutdown::trigger(&service_shutdown_tx);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    shutdown::trigger(&service_shutdown_tx);

    let drain_result = drain_join_set(&mut join_set).await;

    if let Some(err) = service_error {
        return Err(err);
    }

    drain_result
}

async fn drain_join_set(join_set: &mut JoinSet<Result<(), BoxError>>) -> Result<(), BoxError> {
    let mut first_err: Option<BoxError> = None;

    while let Some(task) = join_set.join_next().await {
        match task {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            Err(join_err) => {
                if first_err.is_none() {
                    first_err = Some(Box::new(join_err) as BoxError);
                }
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err);
    }

    Ok(())
}
