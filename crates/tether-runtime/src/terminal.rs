//! Terminal collaborator for [`BridgeMode::Terminal`](crate::orchestrator::BridgeMode).
//!
//! [`ProcessTerminal`] drives a child process over pipes. There is no PTY, so
//! `resize` is recorded but has no effect on the child.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};

/// Output or lifecycle event of a terminal process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Bytes written by the process (stdout and stderr interleaved).
    Output(Vec<u8>),
    /// The process is gone.
    Exited {
        /// Exit code, `None` when killed.
        code: Option<i32>,
    },
}

/// An interactive process the viewer types into.
#[async_trait]
pub trait TerminalProcess: Send + Sync {
    /// Start `command`. Events arrive on the returned receiver until `Exited`.
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<mpsc::Receiver<TerminalEvent>>;

    /// Write raw bytes to the process's input.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Report a new window size.
    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Terminate the process.
    async fn kill(&self) -> Result<()>;
}

#[derive(Default)]
struct Running {
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
}

/// Piped child process.
pub struct ProcessTerminal {
    running: tokio::sync::Mutex<Running>,
    size: Mutex<(u16, u16)>,
}

impl ProcessTerminal {
    /// Idle terminal; call [`TerminalProcess::spawn`] to start it.
    pub fn new() -> Self {
        Self {
            running: tokio::sync::Mutex::new(Running::default()),
            size: Mutex::new((80, 24)),
        }
    }

    /// Whether a process was spawned and not yet killed.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.kill.is_some()
    }

    /// Last size reported through `resize`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }
}

#[async_trait]
impl TerminalProcess for ProcessTerminal {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<mpsc::Receiver<TerminalEvent>> {
        let mut running = self.running.lock().await;
        if running.kill.is_some() {
            return Err(EngineError::Unavailable("terminal already running".into()));
        }

        let mut child = Command::new(command)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn {
                command: command.to_owned(),
                message: e.to_string(),
            })?;
        debug!(command, pid = ?child.id(), "terminal spawned");
        let stdin = child.stdin.take();

        let (tx, rx) = mpsc::channel(256);
        let readers = [
            child.stdout.take().map(|s| tokio::spawn(forward(s, tx.clone()))),
            child.stderr.take().map(|s| tokio::spawn(forward(s, tx.clone()))),
        ];
        let (kill_tx, kill_rx) = oneshot::channel();

        let _ = tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(error) => {
                        warn!(%error, "terminal wait failed");
                        None
                    }
                },
                _ = kill_rx => {
                    if let Err(error) = child.kill().await {
                        warn!(%error, "terminal kill failed");
                    }
                    None
                }
            };
            // Drain output before announcing the exit.
            for reader in readers.into_iter().flatten() {
                let _ = reader.await;
            }
            debug!(?code, "terminal exited");
            let _ = tx.send(TerminalEvent::Exited { code }).await;
        });

        running.stdin = stdin;
        running.kill = Some(kill_tx);
        Ok(rx)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut running = self.running.lock().await;
        let stdin = running
            .stdin
            .as_mut()
            .ok_or_else(|| EngineError::Unavailable("terminal not running".into()))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        debug!(cols, rows, "terminal resize ignored for piped process");
        *self.size.lock() = (cols, rows);
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        running.stdin = None;
        if let Some(kill) = running.kill.take() {
            let _ = kill.send(());
        }
        Ok(())
    }
}

impl Default for ProcessTerminal {
    fn default() -> Self {
        Self::new()
    }
}

async fn forward<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<TerminalEvent>) {
    let mut buf = vec![0_u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(TerminalEvent::Output(buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                debug!(%error, "terminal read ended");
                return;
            }
        }
    }
}
