//! Launching and supervising one sandboxed process per session.
//!
//! stdout and stderr are each drained by their own task, so lines from one
//! stream reach the log hub in the order the process wrote them. Once the
//! process is gone an `exit` event closes the session's log stream.

use crate::error::{OrchestratorError, Result};
use crate::logs::{LogEvent, LogHub, LogKind};
use crate::runtime::{LaunchContext, SandboxRuntime, ARTIFACT_DIR};
use crate::workspace::WorkspaceManager;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for output readers after the process itself is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BuildOutcome {
    pub artifact_path: PathBuf,
}

pub struct ProcessSupervisor {
    runtime: Arc<dyn SandboxRuntime>,
    hub: LogHub,
    workspaces: WorkspaceManager,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        hub: LogHub,
        workspaces: WorkspaceManager,
        stop_grace: Duration,
    ) -> Self {
        Self {
            runtime,
            hub,
            workspaces,
            stop_grace,
        }
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Run the build to completion and relocate its output.
    pub async fn run_build(&self, session_id: &str, workspace: &Path) -> Result<BuildOutcome> {
        let ctx = LaunchContext::new(session_id, workspace);
        let mut child = spawn(self.runtime.build_command(&ctx), session_id)?;
        info!(session_id, runtime = self.runtime.name(), "Build started");

        let (stdout_pump, stderr_pump) = attach_output(&self.hub, session_id, &mut child);
        let status = child
            .wait()
            .await
            .map_err(|e| OrchestratorError::infra("wait for build", e))?;
        let stderr = drain(stdout_pump, stderr_pump).await;
        self.publish(session_id, LogKind::Exit, describe(&status));

        if !status.success() {
            warn!(session_id, %status, "Build failed");
            return Err(OrchestratorError::BuildFailure {
                message: format!("build {}", describe(&status)),
                stderr,
            });
        }

        let workspaces = self.workspaces.clone();
        let id = session_id.to_string();
        let built = workspace.join(ARTIFACT_DIR);
        let artifact_path = tokio::task::spawn_blocking(move || {
            workspaces.relocate_artifact(&id, &built)
        })
        .await
        .map_err(|e| OrchestratorError::infra("relocate task", e))??;

        self.publish(session_id, LogKind::Log, "Build artifact published");
        Ok(BuildOutcome { artifact_path })
    }

    /// Start a long-running service bound to `port`.
    pub async fn run_service(
        &self,
        session_id: &str,
        workspace: &Path,
        port: u16,
    ) -> Result<ServiceHandle> {
        let ctx = LaunchContext::new(session_id, workspace);
        let mut child = spawn(self.runtime.service_command(&ctx, port), session_id)?;
        let pid = child.id();
        info!(session_id, port, ?pid, runtime = self.runtime.name(), "Service started");

        let (stdout_pump, stderr_pump) = attach_output(&self.hub, session_id, &mut child);
        let (kill_tx, kill_rx) = oneshot::channel();
        let hub = self.hub.clone();
        let id = session_id.to_string();
        let grace = self.stop_grace;

        let watcher = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => terminate(&mut child, pid, grace).await,
            };
            drain(stdout_pump, stderr_pump).await;

            let message = match &status {
                Ok(status) => describe(status),
                Err(e) => format!("wait failed: {}", e),
            };
            info!(session_id = %id, %message, "Service process ended");
            hub.publish(&id, LogEvent::new(&id, LogKind::Exit, message));
        });

        Ok(ServiceHandle {
            session_id: session_id.to_string(),
            port,
            control: Mutex::new(Some(StopControl {
                kill_tx,
                watcher,
                teardown: self.runtime.teardown_command(&ctx),
            })),
        })
    }

    /// Stop a service. Only the first call does anything; it returns `true`.
    pub async fn stop(&self, handle: &ServiceHandle) -> bool {
        handle.stop().await
    }

    fn publish(&self, session_id: &str, kind: LogKind, message: impl Into<String>) {
        self.hub
            .publish(session_id, LogEvent::new(session_id, kind, message));
    }
}

struct StopControl {
    kill_tx: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
    teardown: Option<Command>,
}

/// Owns a running service process.
pub struct ServiceHandle {
    session_id: String,
    port: u16,
    control: Mutex<Option<StopControl>>,
}

impl ServiceHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_stopped(&self) -> bool {
        self.control.lock().map(|c| c.is_none()).unwrap_or(true)
    }

    pub async fn stop(&self) -> bool {
        let control = match self.control.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(control) = control else {
            debug!(session_id = %self.session_id, "Service already stopped");
            return false;
        };

        // The watcher may have finished on its own already.
        let _ = control.kill_tx.send(());
        if let Err(e) = control.watcher.await {
            error!(session_id = %self.session_id, error = %e, "Service watcher panicked");
        }

        if let Some(mut teardown) = control.teardown {
            teardown.stdout(Stdio::null()).stderr(Stdio::null());
            match teardown.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => debug!(session_id = %self.session_id, %status, "Teardown exited non-zero"),
                Err(e) => warn!(session_id = %self.session_id, error = %e, "Teardown failed"),
            }
        }

        info!(session_id = %self.session_id, port = self.port, "Service stopped");
        true
    }
}

fn spawn(mut cmd: Command, session_id: &str) -> Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group so signals reach everything the sandbox spawned.
    cmd.process_group(0);

    cmd.spawn().map_err(|e| {
        error!(session_id, error = %e, "Failed to spawn sandbox process");
        OrchestratorError::infra("spawn sandbox", e)
    })
}

fn attach_output(
    hub: &LogHub,
    session_id: &str,
    child: &mut Child,
) -> (Option<JoinHandle<String>>, Option<JoinHandle<String>>) {
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, hub.clone(), session_id.to_string(), LogKind::Log)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, hub.clone(), session_id.to_string(), LogKind::Error)));
    (stdout, stderr)
}

/// Forward each line as soon as it arrives; stderr text is also collected.
/// Invalid UTF-8 is replaced, never fatal.
async fn pump<R>(reader: R, hub: LogHub, session_id: String, kind: LogKind) -> String
where
    R: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    // Raw bytes: the pipe must be drained to EOF whatever the process writes.
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Output stream read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(strip_newline(&buf)).into_owned();
        if kind == LogKind::Error {
            collected.push_str(&line);
            collected.push('\n');
        }
        hub.publish(&session_id, LogEvent::new(&session_id, kind, line));
    }
    collected
}

fn strip_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Wait for both readers, bounded; returns the collected stderr.
async fn drain(
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
) -> String {
    let mut collected = String::new();
    for (pump, keep) in [(stdout, false), (stderr, true)] {
        let Some(mut pump) = pump else { continue };
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await {
            Ok(Ok(text)) if keep => collected = text,
            Ok(_) => {}
            Err(_) => pump.abort(),
        }
    }
    collected
}

/// SIGTERM the process group, then SIGKILL after `grace`.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = pid {
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        let _ = killpg(group, Signal::SIGKILL);
    }

    child.kill().await?;
    child.wait().await
}

fn describe(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {}", code),
        None => "terminated by signal".to_string(),
    }
}
