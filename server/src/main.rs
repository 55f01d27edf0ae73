use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use common_net::telemetry;
use server::{BoxError, ServerConfig, ServerSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Single-process broadcast hub: gateway, assembler and session manager")]
struct ServerCli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[arg(long, value_name = "ADDR")]
    gateway_bind: Option<SocketAddr>,

    #[arg(long, value_name = "ADDR")]
    assembler_metrics_addr: Option<SocketAddr>,

    #[arg(long, value_name = "ADDR")]
    session_manager_metrics_addr: Option<SocketAddr>,

    #[arg(long, value_name = "DIR")]
    staging_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

impl ServerCli {
    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        std::env::var("SERVER_CONFIG_PATH").ok().map(PathBuf::from)
    }

    fn apply_overrides(&self, settings: &mut ServerSettings) {
        if let Some(addr) = self.gateway_bind {
            settings.gateway.bind_addr = addr;
        }
        if let Some(addr) = self.assembler_metrics_addr {
            settings.assembler.metrics_addr = addr;
        }
        if let Some(addr) = self.session_manager_metrics_addr {
            settings.session_manager.metrics_addr = addr;
        }
        if let Some(dir) = &self.staging_dir {
            settings.assembler.staging_dir = dir.display().to_string();
        }
        if let Some(dir) = &self.output_dir {
            settings.assembler.output_dir = dir.display().to_string();
        }
    }
}

fn build_config(cli: &ServerCli) -> Result<ServerConfig, BoxError> {
    let mut settings = if let Some(path) = cli.resolve_config_path() {
        ServerSettings::from_file(&path)?
    } else {
        ServerSettings::from_env()?
    };

    cli.apply_overrides(&mut settings);

    Ok(settings.into_config())
}

#[tokio::main]
async fn main() {
    telemetry::init("server");

    let cli = ServerCli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "server: invalid configuration");
            return;
        }
    };

    if let Err(err) = server::run_with_ctrl_c(config).await {
        tracing::error!(%err, "server exited with error");
    }
}
