use std::sync::Arc;

use assembler::{AssemblerConfig, FfmpegTool};
use common_net::telemetry;
use gateway::{GatewayConfig, GatewaySettings, HubState};
use pocketbase::PocketBaseClient;
use session_manager::SessionManagerState;

#[tokio::main]
async fn main() {
    telemetry::init("gateway");

    let settings = match GatewaySettings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(%err, "gateway: invalid configuration");
            return;
        }
    };
    let assembler_config = match AssemblerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "gateway: invalid assembler configuration");
            return;
        }
    };

    let sessions = SessionManagerState::shared(&settings.pocketbase_url);
    let chunks = assembler::ChunkStore::new(assembler_config.staging_dir.clone());
    let (scheduler, queue) = assembler::scheduler();
    let tool: Arc<dyn assembler::MediaTool> = Arc::new(FfmpegTool::new());

    let (_shutdown_tx, shutdown_rx) = common_net::shutdown::channel();
    tokio::spawn(assembler::run(
        assembler_config,
        queue,
        sessions.clone(),
        tool,
        shutdown_rx,
    ));

    let state = HubState::new(
        sessions,
        chunks,
        scheduler,
        PocketBaseClient::new(&settings.pocketbase_url),
    );
    let config = GatewayConfig::from_settings(settings);

    if let Err(err) = gateway::run_with_ctrl_c(config, state).await {
        tracing::error!(%err, "gateway exited with error");
    }
}
