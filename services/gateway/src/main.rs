use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gate_core::Gateway;
use gateway::config;
use gateway::static_registry::StaticRegistry;

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "Stateful client-facing gateway")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "/etc/gatehouse/gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cfg = match config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "config load failed");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(StaticRegistry::new(&cfg.static_instances));
    let gateway = Gateway::new(cfg.app.clone(), cfg.to_options(), registry);

    if let Err(e) = gateway.start().await {
        error!(error = %e, "gateway startup failed");
        std::process::exit(1);
    }
    info!(app_id = %cfg.app.id, addr = %cfg.options.receiver_proto_addr, "gateway running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal wait failed");
    }
    info!("shutting down");
    gateway.stop().await;
}
