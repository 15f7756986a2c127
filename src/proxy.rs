//! Proxy lifecycle.
//!
//! [`Proxy::run`] wires the pieces together and walks the proxy through its
//! states:
//!
//! ```text
//! Starting ──► Running ──► Draining ──► Stopped
//! ```
//!
//! - **Starting**: the backend channel and listener are handed in already
//!   open; the backend reader and multiplexer tasks are spawned.
//! - **Running**: connections are accepted, each served by its own session
//!   task.
//! - **Draining**: entered when the shutdown token is cancelled (signal,
//!   backend exit, backend EOF or write failure). The listener is closed,
//!   every pending call fails with a system error and every session is
//!   released.
//! - **Stopped**: all tasks are finished or aborted and `run` returns.

pub mod backend;
pub mod mux;
pub mod routes;
pub mod session;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, ProxyError};
use crate::ipc::{BoxReader, BoxWriter, FrameReader, Framing, Listener};

pub use backend::{BackendClient, BackendEvent, Subprocess};
pub use mux::{DrainSummary, MuxHandle, Multiplexer};
pub use routes::{CallTag, PendingCall, RouteTable, SessionId};
pub use session::Session;

/// Default number of calls allowed in flight to the backend at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default grace period for sessions to flush after draining starts.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// How a client batch is sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMode {
    /// Each element becomes its own backend call; elements fail
    /// independently.
    #[default]
    Split,
    /// The batch is sent as one backend batch frame.
    Native,
}

impl FromStr for BatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "split" => Ok(BatchMode::Split),
            "native" => Ok(BatchMode::Native),
            other => Err(ConfigError::UnknownBatchMode(other.to_string())),
        }
    }
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchMode::Split => write!(f, "split"),
            BatchMode::Native => write!(f, "native"),
        }
    }
}

/// Lifecycle state, observable through [`Proxy::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Starting => "starting",
            ProxyState::Running => "running",
            ProxyState::Draining => "draining",
            ProxyState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Runtime knobs for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub client_framing: Framing,
    pub backend_framing: Framing,
    pub concurrency: usize,
    pub batch_mode: BatchMode,
    pub call_timeout: Option<Duration>,
    pub drain_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            client_framing: Framing::Raw,
            backend_framing: Framing::Raw,
            concurrency: DEFAULT_CONCURRENCY,
            batch_mode: BatchMode::Split,
            call_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

pub struct Proxy {
    options: ProxyOptions,
    state: watch::Sender<ProxyState>,
}

impl Proxy {
    pub fn new(options: ProxyOptions) -> Self {
        let (state, _) = watch::channel(ProxyState::Starting);
        Self { options, state }
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    fn set_state(&self, state: ProxyState) {
        debug!("Proxy {}", state);
        self.state.send_replace(state);
    }

    /// Serve clients on `listener` over the backend channel until `shutdown`
    /// is cancelled or the backend goes away.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` for a zero concurrency limit and
    /// `ProxyError::Join` if the multiplexer task panicked.
    pub async fn run(
        self,
        listener: Listener,
        backend_reader: BoxReader,
        backend_writer: BoxWriter,
        shutdown: CancellationToken,
    ) -> Result<DrainSummary, ProxyError> {
        if self.options.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency.into());
        }

        let backend = BackendClient::new(backend_writer, self.options.backend_framing.clone());
        let (mux, handle) = Multiplexer::new(
            backend,
            self.options.concurrency,
            self.options.call_timeout,
            shutdown.clone(),
        );
        let reader = FrameReader::new(backend_reader, self.options.backend_framing.clone());
        let backend_task = backend::spawn_reader(reader, handle.sender());
        let mux_task = tokio::spawn(mux.run());

        match listener.local_addr() {
            Ok(addr) => info!("Listening on {}", addr),
            Err(e) => warn!("Listening on unknown address: {}", e),
        }
        self.set_state(ProxyState::Running);

        let mut sessions = JoinSet::new();
        let mut accept_failures = 0u32;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Session task panicked: {}", e);
                        }
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok(connection) => {
                        accept_failures = 0;
                        let session = Session::new(
                            connection,
                            &self.options.client_framing,
                            handle.clone(),
                            self.options.batch_mode,
                        );
                        sessions.spawn(session.run());
                    }
                    Err(e) => {
                        // Usually out of descriptors; give sessions time to close some.
                        let pause = accept_backoff(accept_failures);
                        if accept_failures == 0 {
                            warn!("Accept failed: {}, retrying in {:?}", e, pause);
                        } else {
                            debug!("Accept failed again: {}, retrying in {:?}", e, pause);
                        }
                        accept_failures = accept_failures.saturating_add(1);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                },
            }
        }

        self.set_state(ProxyState::Draining);
        info!("Draining {} sessions", sessions.len());
        drop(listener);
        drop(handle);

        let summary = mux_task.await?;

        let grace = tokio::time::timeout(self.options.drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if grace.is_err() {
            warn!(
                "{} sessions still open after {:?}, aborting",
                sessions.len(),
                self.options.drain_timeout
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        backend_task.abort();
        let _ = backend_task.await;

        self.set_state(ProxyState::Stopped);
        info!("Proxy stopped");
        Ok(summary)
    }
}

/// Pause after `failures` consecutive accept errors: 10ms doubling to 1s.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << failures.min(7))
        .min(ACCEPT_BACKOFF_MAX)
}
