//! External process launch and lifecycle
//!
//! One wrapped tool (converter, scale probe, upscaler backend) runs per
//! logical operation. Hidden processes get their stdout and stderr piped
//! and streamed line-by-line, in arrival order per stream, to a
//! caller-supplied channel; visible processes inherit the console and
//! forfeit programmatic progress tracking. Completion is observed with a
//! bounded poll (`try_wait` plus a short sleep) so a `kill` from another
//! task unblocks the waiter within one tick.

use crate::error::LaunchError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc};

/// Which pipe a line arrived on. Interleaving *between* the two streams
/// is not ordered; consumers must not depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One raw line of tool output, as produced, before classification.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Everything needed to start one wrapped tool.
///
/// The working directory is set directly on the spawned process; the
/// wrapped executables expect to run from their own install directory.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Hidden processes are piped and streamed; visible ones inherit the
    /// console (interactive/debug mode).
    pub hidden: bool,
    /// Log prefix identifying the tool, e.g. `NCNN` or `ModelConverter`.
    pub component: &'static str,
}

/// Opaque handle to a spawned process. Owned by the launching operation
/// until the process resolves; resolved exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

/// How a process ended. Exit codes of the wrapped tools are recorded but
/// not trusted as failure signals; classified error lines are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub success: bool,
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub const KILLED: ExitOutcome = ExitOutcome {
        success: false,
        code: None,
    };
}

/// Trait for launching and resolving external processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Start the process immediately. When `spec.hidden` is set, every
    /// output line is forwarded to `lines` as it arrives, never batched.
    async fn launch(
        &self,
        spec: SpawnSpec,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<ProcessHandle, LaunchError>;

    /// Suspend until the process exits. Resolves with a failed outcome
    /// for a killed or unknown handle.
    async fn wait(&self, handle: &ProcessHandle) -> ExitOutcome;

    /// Terminate the process. A concurrent `wait` resolves shortly after.
    async fn kill(&self, handle: &ProcessHandle);

    /// Whether the handle still refers to a live, unreaped process.
    async fn is_running(&self, handle: &ProcessHandle) -> bool;
}

/// Shared slot naming the one live wrapped process of the current
/// operation, whichever tool that is. Every launch site registers its
/// handle here before waiting, so an abort from another task can
/// terminate the converter or scale helper just as well as the backend.
#[derive(Clone, Default)]
pub struct ActiveProcess {
    slot: Arc<RwLock<Option<ProcessHandle>>>,
}

impl ActiveProcess {
    pub async fn register(&self, handle: ProcessHandle) {
        *self.slot.write().await = Some(handle);
    }

    pub async fn clear(&self) {
        self.slot.write().await.take();
    }

    /// Unregister and return the live handle; exactly one caller gets
    /// to act on it.
    pub async fn take(&self) -> Option<ProcessHandle> {
        self.slot.write().await.take()
    }
}

/// Production runner using tokio::process.
pub struct SystemProcessRunner {
    processes: Arc<RwLock<HashMap<String, Child>>>,
    /// Outcomes of resolved processes, retained so `wait` on an
    /// already-reaped handle stays answerable. One entry per process for
    /// the runner's lifetime.
    outcomes: Arc<RwLock<HashMap<String, ExitOutcome>>>,
    poll_interval: Duration,
    next_id: AtomicU64,
}

impl SystemProcessRunner {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            outcomes: Arc::new(RwLock::new(HashMap::new())),
            poll_interval,
            next_id: AtomicU64::new(1),
        }
    }

    fn spawn_line_reader<R>(
        reader: R,
        stream: OutputStream,
        component: &'static str,
        sender: Option<mpsc::UnboundedSender<OutputLine>>,
    ) where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(text)) = lines.next_line().await {
                tracing::debug!(component, stream = ?stream, line = %text, "tool output");
                if let Some(sender) = &sender {
                    // Receiver gone means the operation stopped caring;
                    // keep draining so the child never blocks on a full pipe.
                    let _ = sender.send(OutputLine { stream, text });
                }
            }
        });
    }
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn launch(
        &self,
        spec: SpawnSpec,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<ProcessHandle, LaunchError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        if spec.hidden {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = cmd
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError {
                program: spec.program.clone(),
                source,
            })?;

        if spec.hidden {
            if let Some(stdout) = child.stdout.take() {
                Self::spawn_line_reader(stdout, OutputStream::Stdout, spec.component, lines.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                Self::spawn_line_reader(stderr, OutputStream::Stderr, spec.component, lines);
            }
        }

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ProcessHandle {
            id: format!("process_{seq}"),
        };

        tracing::info!(
            component = spec.component,
            program = %spec.program,
            args = ?spec.args,
            cwd = ?spec.cwd,
            pid = ?child.id(),
            hidden = spec.hidden,
            "process spawned"
        );

        self.processes.write().await.insert(handle.id.clone(), child);

        Ok(handle)
    }

    async fn wait(&self, handle: &ProcessHandle) -> ExitOutcome {
        loop {
            {
                let mut processes = self.processes.write().await;
                let polled = processes.get_mut(&handle.id).map(|child| child.try_wait());

                match polled {
                    // Killed or already reaped by an earlier wait.
                    None => {
                        return self
                            .outcomes
                            .read()
                            .await
                            .get(&handle.id)
                            .copied()
                            .unwrap_or(ExitOutcome::KILLED);
                    }
                    Some(Ok(Some(status))) => {
                        processes.remove(&handle.id);
                        let outcome = ExitOutcome {
                            success: status.success(),
                            code: status.code(),
                        };
                        self.outcomes.write().await.insert(handle.id.clone(), outcome);
                        tracing::info!(
                            handle = %handle.id,
                            code = ?outcome.code,
                            "process exited"
                        );
                        return outcome;
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(handle = %handle.id, error = %e, "try_wait failed");
                        processes.remove(&handle.id);
                        return ExitOutcome::KILLED;
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn kill(&self, handle: &ProcessHandle) {
        let child = self.processes.write().await.remove(&handle.id);
        let Some(mut child) = child else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let pid = Pid::from_raw(pid as i32);
                let _ = kill(pid, Signal::SIGTERM);

                tokio::select! {
                    _ = child.wait() => {
                        tracing::info!(handle = %handle.id, "process terminated");
                    }
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {
                        tracing::warn!(handle = %handle.id, "SIGTERM timeout, sending SIGKILL");
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }

        self.outcomes
            .write()
            .await
            .insert(handle.id.clone(), ExitOutcome::KILLED);
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        self.processes.read().await.contains_key(&handle.id)
    }
}
