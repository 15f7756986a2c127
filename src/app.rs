//! Application wiring: subprocess, listener and proxy.
//!
//! [`App::start`] performs everything that can fail before the proxy is
//! running (spawning the backend command, binding the address), so startup
//! errors surface before a single connection is accepted. [`App::run`]
//! serves until shutdown and makes sure the subprocess does not outlive it.

use anyhow::{Context, Result};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::ipc::{BoxReader, BoxWriter, ListenAddr, Listener};
use crate::proxy::{DrainSummary, Proxy, ProxyState, Subprocess};

pub struct App {
    proxy: Proxy,
    listener: Listener,
    child: Child,
    backend_reader: BoxReader,
    backend_writer: BoxWriter,
}

impl App {
    /// Spawn the backend command and bind the listener.
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        let Subprocess { child, reader, writer } = Subprocess::spawn(&config.command)
            .with_context(|| format!("Failed to start {:?}", config.command.join(" ")))?;

        // The child is killed on drop if binding fails.
        let listener = Listener::bind(&config.address).await?;

        info!(
            "jproxy v{}: {} (client framing {}, server framing {}, concurrency {})",
            env!("CARGO_PKG_VERSION"),
            config.address,
            config.options.client_framing,
            config.options.backend_framing,
            config.options.concurrency
        );

        Ok(Self {
            proxy: Proxy::new(config.options),
            listener,
            child,
            backend_reader: reader,
            backend_writer: writer,
        })
    }

    /// The address clients should connect to.
    pub fn local_addr(&self) -> std::io::Result<ListenAddr> {
        self.listener.local_addr()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProxyState> {
        self.proxy.subscribe()
    }

    /// Serve until `shutdown` is cancelled or the subprocess exits.
    pub async fn run(self, shutdown: CancellationToken) -> Result<DrainSummary> {
        let Self {
            proxy,
            listener,
            mut child,
            backend_reader,
            backend_writer,
        } = self;

        let stopped = CancellationToken::new();
        let watcher = {
            let shutdown = shutdown.clone();
            let stopped = stopped.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => info!("Subprocess exited: {}", status),
                            Err(e) => warn!("Failed to wait for subprocess: {}", e),
                        }
                        shutdown.cancel();
                    }
                    _ = stopped.cancelled() => {
                        debug!("Stopping subprocess");
                        if let Err(e) = child.kill().await {
                            warn!("Failed to kill subprocess: {}", e);
                        }
                    }
                }
            })
        };

        let result = proxy
            .run(listener, backend_reader, backend_writer, shutdown)
            .await
            .context("Proxy failed");

        stopped.cancel();
        if let Err(e) = watcher.await {
            warn!("Subprocess watcher failed: {}", e);
        }
        result
    }
}
