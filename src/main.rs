use clap::Parser;
use socks_balancer::api::run_admin_server;
use socks_balancer::config::Config;
use socks_balancer::server::ProxyServer;
use socks_balancer::utils::error::BalancerError;
use socks_balancer::Result;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "socks-balancer")]
#[command(about = "TCP-level load balancer fronting a fleet of SOCKS5 upstream proxies", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config).map_err(|e| {
        eprintln!("failed to load configuration from {:?}: {}", args.config, e);
        e
    })?;

    init_logging(&config.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting");
    info!(path = ?args.config, "configuration loaded");

    let server = ProxyServer::new(config.clone());

    let admin_host = config.state_server_host.clone();
    let admin_port = config.state_server_port;
    let admin_server = server.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(e) = run_admin_server(admin_server, &admin_host, admin_port).await {
            error!(error = %e, "admin HTTP server exited");
        }
    });

    let shutdown = tokio::spawn(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        info!("received shutdown signal");
    });

    let run_server = server.clone();
    tokio::select! {
        result = run_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                admin_task.abort();
                return Err(e);
            }
        }
        _ = shutdown => {
            info!("shutting down gracefully");
        }
    }

    server.shutdown();
    admin_task.abort();

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| BalancerError::Config(format!("invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
