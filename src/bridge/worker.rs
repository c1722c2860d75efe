//! Worker process attachment.
//!
//! [`WorkerLink`] is the seam between the bridge's event loop and whatever
//! actually serves inference. Production uses [`ChildProcessLink`], which
//! spawns a worker subprocess and speaks NDJSON over its stdio; tests plug
//! in scripted in-process doubles.

use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Line-oriented channels to one live worker.
///
/// Writing to `input` sends one NDJSON line to the worker; `output` yields
/// its stdout lines. The `output` channel closing means the worker exited.
pub struct WorkerIo {
    /// Request lines toward the worker.
    pub input: mpsc::Sender<String>,
    /// Response lines from the worker.
    pub output: mpsc::Receiver<String>,
}

/// Starting a worker failed.
#[derive(Error, Debug)]
pub enum WorkerStartError {
    /// The worker process could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    /// The spawned process is missing a stdio handle.
    #[error("worker stdio unavailable: {0}")]
    Stdio(&'static str),
}

/// Starts workers on demand.
///
/// The bridge calls `start` once at boot and again after every worker
/// death; implementations must return a fresh [`WorkerIo`] each time.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    /// Start (or restart) the worker and return its I/O channels.
    async fn start(&self) -> Result<WorkerIo, WorkerStartError>;
}

/// Spawns a worker subprocess with piped stdio.
///
/// The child is killed when its handles drop, so an abandoned bridge never
/// leaks a worker process.
#[derive(Debug, Clone)]
pub struct ChildProcessLink {
    program: String,
    args: Vec<String>,
}

/// Capacity of the stdin/stdout line channels. Small on purpose: real
/// backpressure lives in the bridge's admission control, not here.
const IO_CHANNEL_CAPACITY: usize = 64;

impl ChildProcessLink {
    /// Describe the worker command to spawn, e.g.
    /// `ChildProcessLink::new("python3", ["worker.py", "--model", path])`.
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl WorkerLink for ChildProcessLink {
    async fn start(&self) -> Result<WorkerIo, WorkerStartError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or(WorkerStartError::Stdio("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerStartError::Stdio("stdout"))?;

        info!(program = %self.program, pid = child.id(), "worker process spawned");

        let (input_tx, mut input_rx) = mpsc::channel::<String>(IO_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel::<String>(IO_CHANNEL_CAPACITY);

        // Writer pump: bridge lines -> worker stdin. A write failure means
        // the worker is gone; the reader pump reports that via channel close.
        tokio::spawn(async move {
            while let Some(line) = input_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    warn!("worker stdin closed, stopping writer pump");
                    break;
                }
            }
        });

        // Reader pump: worker stdout -> bridge. Owns the child handle so
        // kill_on_drop fires when the pump (and thus the bridge) is done
        // with this incarnation.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if output_tx.send(line).await.is_err() {
                            debug!("bridge dropped output channel, stopping reader pump");
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("worker stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "worker stdout read error");
                        break;
                    }
                }
            }
            drop(child);
        });

        Ok(WorkerIo {
            input: input_tx,
            output: output_rx,
        })
    }
}
