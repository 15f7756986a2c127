//! The single shared backend channel.
//!
//! Writes go through [`BackendClient`], owned by the multiplexer. Reads run
//! in their own task ([`spawn_reader`]) that decodes frames and posts them to
//! the multiplexer, so a slow or silent backend never blocks a send.

use std::process::Stdio;

use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BackendError, FramingError};
use crate::ipc::{BoxReader, BoxWriter, FrameReader, FrameWriter, Framing};
use crate::proxy::mux::Command as MuxCommand;

/// What the backend reader reports to the multiplexer.
#[derive(Debug)]
pub enum BackendEvent {
    /// One decoded JSON value (a response, or an array of them).
    Frame(Value),
    /// The backend stream ended or failed. Always the last event.
    Closed(String),
}

/// Write half of the backend channel.
pub struct BackendClient {
    writer: FrameWriter<BoxWriter>,
    dead: bool,
}

impl BackendClient {
    pub fn new(writer: BoxWriter, framing: Framing) -> Self {
        Self {
            writer: FrameWriter::new(writer, framing),
            dead: false,
        }
    }

    /// Write one message to the backend.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Dead` if an earlier write already failed, and
    /// `BackendError::Write` if this write fails (the client is dead after).
    pub async fn send(&mut self, message: &Value) -> Result<(), BackendError> {
        if self.dead {
            return Err(BackendError::Dead);
        }
        match self.writer.write_value(message).await {
            Ok(()) => Ok(()),
            // Encoding failures say nothing about the channel.
            Err(e @ FramingError::Encode(_)) => Err(BackendError::Write(e)),
            Err(e) => {
                self.dead = true;
                Err(BackendError::Write(e))
            }
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Close the write side so the backend sees EOF on its input.
    pub async fn close(&mut self) {
        self.dead = true;
        if let Err(e) = self.writer.shutdown().await {
            debug!("Backend shutdown: {}", e);
        }
    }
}

/// Run the backend receive loop in its own task.
///
/// Every decoded frame is posted as [`BackendEvent::Frame`]; the loop ends
/// with exactly one [`BackendEvent::Closed`], or silently when the
/// multiplexer has already gone away.
pub fn spawn_reader(
    mut reader: FrameReader<BoxReader>,
    events: mpsc::UnboundedSender<MuxCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => match serde_json::from_slice::<Value>(&frame) {
                    Ok(value) => {
                        if events.send(MuxCommand::Backend(BackendEvent::Frame(value))).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Skipping undecodable backend frame: {}", e),
                },
                Ok(None) => break "backend closed its output".to_string(),
                Err(e) => break format!("backend read failed: {}", e),
            }
        };
        let _ = events.send(MuxCommand::Backend(BackendEvent::Closed(reason)));
    })
}

/// A started backend command with its stdio taken over as the channel.
pub struct Subprocess {
    pub child: Child,
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

impl Subprocess {
    /// Start `argv[0]` with `argv[1..]`, stdin and stdout piped, stderr
    /// inherited. The process is killed if the handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `argv` is empty or the process cannot be started.
    pub fn spawn(argv: &[String]) -> std::io::Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line")
        })?;

        info!("Starting backend: {}", argv.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "backend stdin not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "backend stdout not captured")
        })?;

        Ok(Self {
            child,
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        })
    }
}
