//! Submission pipelines tying the components together.
//!
//! A submission either reaches a usable state (servable artifact or
//! routable endpoint) or fails and leaves nothing behind.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::eviction::EvictionScheduler;
use crate::logs::{LogEvent, LogHub, LogKind};
use crate::ports::PortAllocator;
use crate::registry::{EndpointInfo, RuntimeEndpoint, SessionRegistry};
use crate::router::{self, SessionRouter};
use crate::runtime::{self, SandboxRuntime};
use crate::state::{new_session_id, FileMap, Reservations, SessionKind};
use crate::supervisor::ProcessSupervisor;
use crate::workspace::{Materialized, WorkspaceManager};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Public prefix under which relocated artifacts are served.
pub const PREVIEW_PREFIX: &str = "/preview";

#[derive(Debug, Clone, Serialize)]
pub struct BuildSubmitted {
    pub session_id: String,
    pub preview_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSubmitted {
    pub session_id: String,
    pub api_base_path: String,
}

pub struct Orchestrator {
    workspaces: WorkspaceManager,
    ports: Arc<PortAllocator>,
    supervisor: Arc<ProcessSupervisor>,
    hub: LogHub,
    registry: SessionRegistry,
    eviction: EvictionScheduler,
    router: SessionRouter,
    reservations: Reservations,
    reservation_ttl: Duration,
}

impl Orchestrator {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self::with_runtime(config, runtime::from_config(config))
    }

    pub fn with_runtime(config: &OrchestratorConfig, runtime: Arc<dyn SandboxRuntime>) -> Self {
        let workspaces = WorkspaceManager::new(&config.workspace_root, &config.public_root);
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start,
            config.max_sessions,
        ));
        let hub = LogHub::new();
        let supervisor = Arc::new(ProcessSupervisor::new(
            runtime,
            hub.clone(),
            workspaces.clone(),
            config.stop_grace,
        ));
        let registry = SessionRegistry::new();
        let eviction = EvictionScheduler::new(
            config.session_ttl,
            registry.clone(),
            workspaces.clone(),
            ports.clone(),
            supervisor.clone(),
        );
        let router = SessionRouter::new(registry.clone());

        Self {
            workspaces,
            ports,
            supervisor,
            hub,
            registry,
            eviction,
            router,
            reservations: Arc::new(RwLock::new(HashMap::new())),
            reservation_ttl: config.reservation_ttl,
        }
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    pub fn public_root(&self) -> PathBuf {
        self.workspaces.public_root().to_path_buf()
    }

    pub fn runtime_name(&self) -> &'static str {
        self.supervisor.runtime_name()
    }

    pub async fn live_sessions(&self) -> Vec<EndpointInfo> {
        self.registry.list().await
    }

    /// Hand out a session id ahead of submission.
    pub async fn reserve(&self) -> String {
        let session_id = new_session_id();
        self.reservations
            .write()
            .await
            .insert(session_id.clone(), Instant::now());
        info!(session_id = %session_id, "Session reserved");
        session_id
    }

    /// Consume a reservation; unknown or already-used ids are `NotFound`.
    pub async fn claim(&self, session_id: &str) -> Result<()> {
        self.reservations
            .write()
            .await
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound(format!("reservation {}", session_id)))
    }

    pub async fn expire_reservations(&self) -> usize {
        let mut reservations = self.reservations.write().await;
        let ttl = self.reservation_ttl;
        let before = reservations.len();
        reservations.retain(|_, created| created.elapsed() <= ttl);
        let expired = before - reservations.len();
        if expired > 0 {
            info!(expired, "Dropped unused reservations");
        }
        expired
    }

    pub async fn submit_build(&self, project_name: &str, files: FileMap) -> Result<BuildSubmitted> {
        self.build_session(&new_session_id(), project_name, files)
            .await
    }

    pub async fn submit_run(&self, project_name: &str, files: FileMap) -> Result<RunSubmitted> {
        self.run_session(&new_session_id(), project_name, files).await
    }

    pub async fn build_session(
        &self,
        session_id: &str,
        project_name: &str,
        files: FileMap,
    ) -> Result<BuildSubmitted> {
        validate_project_name(project_name)?;
        info!(session_id, project = project_name, "Build submitted");

        let workspace = self.materialize(session_id, files, SessionKind::Build).await?;
        let outcome = self.supervisor.run_build(session_id, &workspace).await;
        // The workspace is private and never outlives the build.
        self.destroy_workspace(session_id).await;

        match outcome {
            Ok(outcome) => {
                info!(session_id, path = ?outcome.artifact_path, "Build ready");
                self.eviction.arm(session_id, SessionKind::Build).await;
                Ok(BuildSubmitted {
                    session_id: session_id.to_string(),
                    preview_url: format!("{}/{}/", PREVIEW_PREFIX, session_id),
                })
            }
            Err(e) => {
                self.destroy_artifact(session_id).await;
                Err(e)
            }
        }
    }

    pub async fn run_session(
        &self,
        session_id: &str,
        project_name: &str,
        files: FileMap,
    ) -> Result<RunSubmitted> {
        validate_project_name(project_name)?;
        info!(session_id, project = project_name, "Run submitted");

        let workspace = self.materialize(session_id, files, SessionKind::Run).await?;

        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                self.destroy_workspace(session_id).await;
                return Err(e);
            }
        };

        let handle = match self.supervisor.run_service(session_id, &workspace, port).await {
            Ok(handle) => handle,
            Err(e) => {
                self.ports.release(port);
                self.destroy_workspace(session_id).await;
                return Err(e);
            }
        };

        let endpoint = RuntimeEndpoint::new(handle);
        let handle = endpoint.handle.clone();
        if let Err(e) = self.registry.register(session_id, endpoint).await {
            warn!(session_id, error = %e, "Registration failed, tearing down service");
            self.supervisor.stop(&handle).await;
            self.ports.release(port);
            self.destroy_workspace(session_id).await;
            return Err(e);
        }

        self.eviction.arm(session_id, SessionKind::Run).await;
        Ok(RunSubmitted {
            session_id: session_id.to_string(),
            api_base_path: router::api_base_path(session_id),
        })
    }

    /// Release a session ahead of its timer.
    pub async fn evict(&self, session_id: &str) -> bool {
        self.eviction.evict(session_id).await
    }

    /// Stop every live session; returns once all have been released.
    pub async fn shutdown(&self) {
        self.eviction.shutdown().await;
    }

    async fn materialize(&self, session_id: &str, files: FileMap, kind: SessionKind) -> Result<PathBuf> {
        let workspaces = self.workspaces.clone();
        let id = session_id.to_string();
        let result = tokio::task::spawn_blocking(move || workspaces.materialize(&id, &files, kind))
            .await
            .map_err(|e| OrchestratorError::infra("materialize task", e))?;

        match result {
            Ok(Materialized { path, scaffolded }) => {
                for file in scaffolded {
                    self.hub.publish(
                        session_id,
                        LogEvent::new(
                            session_id,
                            LogKind::Log,
                            format!("{} not provided, using default", file),
                        ),
                    );
                }
                Ok(path)
            }
            Err(e @ OrchestratorError::InvalidInput(_)) => Err(e),
            Err(e) => {
                // A half-written workspace must not survive.
                self.destroy_workspace(session_id).await;
                Err(e)
            }
        }
    }

    async fn destroy_workspace(&self, session_id: &str) {
        let workspaces = self.workspaces.clone();
        let id = session_id.to_string();
        match tokio::task::spawn_blocking(move || workspaces.destroy(&id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id, error = %e, "Failed to remove workspace"),
            Err(e) => warn!(session_id, error = %e, "Workspace cleanup task failed"),
        }
    }

    async fn destroy_artifact(&self, session_id: &str) {
        let workspaces = self.workspaces.clone();
        let id = session_id.to_string();
        match tokio::task::spawn_blocking(move || workspaces.destroy_artifact(&id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id, error = %e, "Failed to remove artifact"),
            Err(e) => warn!(session_id, error = %e, "Artifact cleanup task failed"),
        }
    }
}

fn validate_project_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(OrchestratorError::InvalidInput(
            "project name is required".to_string(),
        ));
    }
    if name.len() > 128 || name.chars().any(char::is_control) {
        return Err(OrchestratorError::InvalidInput(format!(
            "malformed project name: {:?}",
            name
        )));
    }
    Ok(())
}
