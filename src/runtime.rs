//! Sandbox backends: how a session's build or service process is launched.

use crate::config::{OrchestratorConfig, RuntimeKind, SERVICE_CONTAINER_PORT};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

/// Build output, relative to the workspace.
pub const ARTIFACT_DIR: &str = "build/web";

/// Unprivileged identity the sandboxed process runs as.
const SANDBOX_USER: &str = "1000:1000";

#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub session_id: String,
    pub workspace: PathBuf,
}

impl LaunchContext {
    pub fn new(session_id: &str, workspace: &Path) -> Self {
        Self {
            session_id: session_id.to_string(),
            workspace: workspace.to_path_buf(),
        }
    }

    pub fn sandbox_name(&self) -> String {
        format!("previewd-{}", self.session_id)
    }
}

/// Produces the commands that run inside the isolated environment.
/// Stdio wiring is left to the caller.
pub trait SandboxRuntime: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// One-shot build that leaves its output under [`ARTIFACT_DIR`].
    fn build_command(&self, ctx: &LaunchContext) -> Command;

    /// Long-running service reachable on `127.0.0.1:<host_port>`.
    fn service_command(&self, ctx: &LaunchContext, host_port: u16) -> Command;

    /// Extra cleanup once the launched process is gone.
    fn teardown_command(&self, _ctx: &LaunchContext) -> Option<Command> {
        None
    }
}

pub fn from_config(config: &OrchestratorConfig) -> Arc<dyn SandboxRuntime> {
    match config.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime {
            build_image: config.build_image.clone(),
            service_image: config.service_image.clone(),
            build_script: config.build_script.clone(),
            service_script: config.service_script.clone(),
        }),
        RuntimeKind::Local => Arc::new(LocalRuntime {
            build_script: config.build_script.clone(),
            service_script: config.service_script.clone(),
        }),
    }
}

/// Runs each session in a throwaway `docker run --rm` container.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    pub build_image: String,
    pub service_image: String,
    pub build_script: String,
    pub service_script: String,
}

impl DockerRuntime {
    fn base(&self, ctx: &LaunchContext) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(ctx.sandbox_name())
            .arg("--user")
            .arg(SANDBOX_USER)
            .arg("-v")
            .arg(format!("{}:/app", ctx.workspace.display()))
            .arg("-w")
            .arg("/app");
        cmd
    }
}

impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn build_command(&self, ctx: &LaunchContext) -> Command {
        let mut cmd = self.base(ctx);
        cmd.arg(&self.build_image)
            .arg("sh")
            .arg("-c")
            .arg(&self.build_script);
        cmd
    }

    fn service_command(&self, ctx: &LaunchContext, host_port: u16) -> Command {
        let mut cmd = self.base(ctx);
        cmd.arg("-p")
            .arg(format!("127.0.0.1:{}:{}", host_port, SERVICE_CONTAINER_PORT))
            .arg("-e")
            .arg(format!("PORT={}", SERVICE_CONTAINER_PORT))
            .arg(&self.service_image)
            .arg("sh")
            .arg("-c")
            .arg(&self.service_script);
        cmd
    }

    fn teardown_command(&self, ctx: &LaunchContext) -> Option<Command> {
        let mut cmd = Command::new("docker");
        cmd.arg("rm").arg("-f").arg(ctx.sandbox_name());
        Some(cmd)
    }
}

/// Runs scripts with `sh -c` straight in the workspace. No isolation.
#[derive(Debug, Clone)]
pub struct LocalRuntime {
    pub build_script: String,
    pub service_script: String,
}

impl LocalRuntime {
    pub fn new(build_script: impl Into<String>, service_script: impl Into<String>) -> Self {
        Self {
            build_script: build_script.into(),
            service_script: service_script.into(),
        }
    }

    fn shell(&self, ctx: &LaunchContext, script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).current_dir(&ctx.workspace);
        cmd
    }
}

impl SandboxRuntime for LocalRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    fn build_command(&self, ctx: &LaunchContext) -> Command {
        self.shell(ctx, &self.build_script)
    }

    fn service_command(&self, ctx: &LaunchContext, host_port: u16) -> Command {
        let mut cmd = self.shell(ctx, &self.service_script);
        cmd.env("PORT", host_port.to_string());
        cmd
    }
}
