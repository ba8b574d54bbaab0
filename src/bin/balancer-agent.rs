//! Tunnel agent: runs next to a backend and serves balancer tunnels.

use clap::Parser;
use tokio::net::TcpListener;

use tunnel_balancer::config::{ListenAddr, ObservabilityConfig, DEFAULT_UNIX_SOCKET};
use tunnel_balancer::lifecycle::{wait_for_signal, Pidfile, Shutdown};
use tunnel_balancer::observability::init_logging;
use tunnel_balancer::tunnel::agent::{Agent, DEFAULT_AGENT_PORT};

#[derive(Parser)]
#[command(name = "balancer-agent", version)]
#[command(about = "Relays balancer tunnel streams to a local service", long_about = None)]
struct Cli {
    /// Address to accept tunnels on.
    #[arg(short, long, default_value_t = format!("0.0.0.0:{}", DEFAULT_AGENT_PORT))]
    listen: String,

    /// Service to relay streams to (tcp://host:port or unix://path).
    #[arg(short, long, default_value_t = format!("unix://{}", DEFAULT_UNIX_SOCKET))]
    to: String,

    /// Write the process id here while running.
    #[arg(long)]
    pidfile: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&ObservabilityConfig {
        log_level: cli.log_level.clone(),
        ..Default::default()
    });

    let target: ListenAddr = cli.to.parse()?;
    let _pidfile = cli.pidfile.as_deref().map(Pidfile::create).transpose()?;

    let listener = TcpListener::bind(&cli.listen).await?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %listener.local_addr()?,
        service = %target,
        "balancer-agent starting"
    );

    let shutdown = Shutdown::new();
    let server = tokio::spawn(Agent::new(target).run(listener, shutdown.subscribe()));

    let signal = wait_for_signal().await?;
    tracing::info!(signal, "Shutting down");
    shutdown.trigger();
    server.await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
