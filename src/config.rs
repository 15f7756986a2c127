//! Command-line configuration.

use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::ipc::{Framing, ListenAddr};
use crate::proxy::{BatchMode, ProxyOptions, DEFAULT_CONCURRENCY};

const AFTER_HELP: &str = "\
The command after the options is started as a subprocess. Its stdin and
stdout carry JSON-RPC 2.0 with the server framing; its stderr is passed
through. Every client connection accepted on ADDRESS is multiplexed onto
that one channel, with request ids rewritten so replies reach the client
that asked.

ADDRESS is host:port for TCP (\":8080\" listens on all interfaces) or a
filesystem path for a Unix-domain socket, which is removed on exit.

The proxy stops on Ctrl-C or when the subprocess exits. Pending calls are
then answered with error -32098 and the subprocess is killed.

Framings: raw, line, header, lsp, header:<mime>, decimal, varint";

#[derive(Parser, Debug, Clone)]
#[command(name = "jproxy", version, about = "JSON-RPC 2.0 multiplexing reverse proxy")]
#[command(after_help = AFTER_HELP)]
pub struct Cli {
    /// Address to listen on (host:port or socket path)
    #[arg(short = 'a', long = "address", value_name = "ADDRESS")]
    pub address: String,

    /// Client channel framing
    #[arg(long = "cf", value_name = "FRAMING", default_value = "raw")]
    pub client_framing: String,

    /// Server (subprocess) channel framing
    #[arg(long = "sf", value_name = "FRAMING", default_value = "raw")]
    pub server_framing: String,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Maximum calls in flight to the subprocess
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Batch forwarding: "split" into single calls or "native" batch frames
    #[arg(long, value_name = "MODE", default_value = "split")]
    pub batch: String,

    /// Fail calls unanswered after this many seconds
    #[arg(long, value_name = "SECS")]
    pub call_timeout: Option<f64>,

    /// Seconds to let connections flush when shutting down
    #[arg(long, value_name = "SECS", default_value_t = 5.0)]
    pub drain_timeout: f64,

    /// Command to execute, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "CMD")]
    pub command: Vec<String>,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "jproxy=debug"
        } else {
            "jproxy=info"
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub address: ListenAddr,
    pub command: Vec<String>,
    pub verbose: bool,
    pub options: ProxyOptions,
}

impl ProxyConfig {
    /// Validate parsed arguments.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: unknown framing or batch mode, bad
    /// address, empty command, or a zero concurrency limit.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let client_framing: Framing = cli.client_framing.parse()?;
        let backend_framing: Framing = cli.server_framing.parse()?;
        let batch_mode: BatchMode = cli.batch.parse()?;
        let address: ListenAddr = cli.address.parse()?;

        if cli.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        if cli.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        Ok(Self {
            address,
            command: cli.command,
            verbose: cli.verbose,
            options: ProxyOptions {
                client_framing,
                backend_framing,
                concurrency: cli.concurrency,
                batch_mode,
                call_timeout: seconds(cli.call_timeout),
                drain_timeout: seconds(Some(cli.drain_timeout)).unwrap_or_default(),
            },
        })
    }
}

/// Non-positive or non-finite values mean "no limit".
fn seconds(value: Option<f64>) -> Option<Duration> {
    value
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
}
