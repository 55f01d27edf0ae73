use session_manager::SessionManagerConfig;

use common_net::telemetry;

#[tokio::main]
async fn main() {
    telemetry::init("session-manager");

    let config = match SessionManagerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "session-manager: invalid configuration");
            return;
        }
    };

    if let Err(err) = session_manager::run_with_ctrl_c(config).await {
        tracing::error!(%err, "session-manager exited with error");
    }
}
