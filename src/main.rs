use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use tunnel_balancer::config::load_config;
use tunnel_balancer::lifecycle::{start, wait_for_signal, Pidfile};
use tunnel_balancer::observability::init_logging;
use tunnel_balancer::tunnel::h2::H2Dialer;

#[derive(Parser)]
#[command(name = "tunnel-balancer", version)]
#[command(about = "TCP/unix-socket load balancer with multiplexed backend tunnels", long_about = None)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "balancer.toml")]
    config: PathBuf,

    /// Reload the backend list when the configuration file changes.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "tunnel-balancer starting"
    );
    tracing::info!(
        mode = ?config.scheduler.mode,
        tunnels = config.tunnel.count,
        service = ?config.health_check.service,
        "{}",
        config.listen_info()
    );

    let _pidfile = config
        .lifecycle
        .pidfile
        .as_deref()
        .map(Pidfile::create)
        .transpose()?;

    let watch_path = cli.watch.then_some(cli.config.as_path());
    let running = start(&config, watch_path, Arc::new(H2Dialer)).await?;

    let signal = wait_for_signal().await?;
    tracing::info!(signal, "Shutting down");

    running
        .shutdown(Duration::from_secs(config.lifecycle.drain_timeout_secs))
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}
