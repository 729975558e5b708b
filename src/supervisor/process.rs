//! Server process handle - spawning with stdio capture, liveness and termination
//!
//! The tokio `Child` is owned by a waiter task. Everyone else (supervisor,
//! console readers, watchdog) holds an `Arc<ServerProcess>` and learns about
//! the exit through a watch channel, so no caller ever blocks on the child
//! itself.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

/// Liveness of a spawned server process as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    /// Exit code, or `None` when killed by a signal or the wait failed.
    Exited(Option<i32>),
}

/// A spawned server process. Never handed out by the supervisor.
pub struct ServerProcess {
    pid: u32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    state_rx: watch::Receiver<ProcessState>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Output of [`ServerProcess::spawn`]: the shared handle plus the output pipes
/// for the console readers.
pub struct SpawnedProcess {
    pub process: Arc<ServerProcess>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl ServerProcess {
    /// Spawn `program` in `working_dir` with all three stdio streams piped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(program: &str, args: &[String], working_dir: &Path) -> std::io::Result<SpawnedProcess> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        // Windows: hide console window
        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned process has no PID")
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (state_tx, state_rx) = watch::channel(ProcessState::Alive);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // ── process waiter ───────────────────────────────────
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill process {}: {}", pid, e);
                    }
                    child.wait().await
                }
            };
            let state = match outcome {
                Ok(status) => {
                    tracing::info!("Server process {} exited with {}", pid, status);
                    ProcessState::Exited(status.code())
                }
                Err(e) => {
                    tracing::error!("Failed to wait for server process {}: {}", pid, e);
                    ProcessState::Exited(None)
                }
            };
            let _ = state_tx.send(state);
        });

        tracing::info!("Spawned '{}' {:?} (PID: {})", program, args, pid);

        Ok(SpawnedProcess {
            process: Arc::new(Self {
                pid,
                stdin: tokio::sync::Mutex::new(stdin),
                state_rx,
                kill_tx: Mutex::new(Some(kill_tx)),
            }),
            stdout,
            stderr,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ProcessState::Alive
    }

    /// Resolves once the process has exited and been reaped.
    pub async fn wait_exit(&self) {
        let mut rx = self.state_rx.clone();
        loop {
            let exited = *rx.borrow_and_update() != ProcessState::Alive;
            if exited {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns `true` if the process exited within `limit`.
    pub async fn wait_exit_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_exit()).await.is_ok()
    }

    /// Ask the process to shut down on its own (SIGTERM on unix).
    pub fn request_shutdown(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        tracing::info!("Requesting graceful shutdown of process {}", self.pid);
        send_terminate(self.pid)
    }

    /// Forcefully terminate the process. Idempotent; the waiter task reaps it.
    pub fn force_kill(&self) {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => {
                tracing::warn!("Force killing process {}", self.pid);
                let _ = tx.send(());
            }
            None => tracing::debug!("Kill already requested for process {}", self.pid),
        }
    }

    /// Write one line to stdin, appending `\n` if absent, and flush.
    pub async fn write_line(&self, text: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin of server process is closed")
        })?;
        let mut data = text.as_bytes().to_vec();
        if !data.ends_with(b"\n") {
            data.push(b'\n');
        }
        stdin.write_all(&data).await?;
        stdin.flush().await
    }
}

// ─── Platform helpers ────────────────────────────────────────

#[cfg(not(target_os = "windows"))]
fn send_terminate(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        // 이미 종료되어 회수된 프로세스
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Failed to send SIGTERM to {}: {}", pid, e)),
    }
}

#[cfg(target_os = "windows")]
fn send_terminate(pid: u32) -> Result<()> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    // /F 없이 호출 → 종료 요청만 보냄
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .creation_flags(CREATE_NO_WINDOW)
        .status()
        .map_err(|e| anyhow::anyhow!("Failed to run taskkill for PID {}: {}", pid, e))?;
    if !status.success() {
        anyhow::bail!("taskkill for PID {} exited with {}", pid, status);
    }
    Ok(())
}

/// Apply platform-specific flags to hide the console window on Windows.
#[cfg(target_os = "windows")]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}
