//! jproxy - JSON-RPC 2.0 multiplexing reverse proxy.
//!
//! Parses the command line, starts the backend command and serves clients
//! until interrupted or until the backend exits.

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use jproxy::app::App;
use jproxy::config::{Cli, ProxyConfig};
use jproxy::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_filter());

    let config = match ProxyConfig::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let app = App::start(config).await?;
    let summary = app.run(shutdown).await?;
    info!(
        "Shut down cleanly ({} calls failed during drain)",
        summary.failed_calls
    );
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Received interrupt, shutting down");
        }
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
