//! Authoritative map of live run sessions to their endpoints.

use crate::error::{OrchestratorError, Result};
use crate::supervisor::ServiceHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::info;

/// The port + process pair backing a run session.
pub struct RuntimeEndpoint {
    pub port: u16,
    pub handle: Arc<ServiceHandle>,
    pub created_at: Instant,
}

impl RuntimeEndpoint {
    pub fn new(handle: ServiceHandle) -> Self {
        Self {
            port: handle.port(),
            handle: Arc::new(handle),
            created_at: Instant::now(),
        }
    }
}

/// Read-only view handed to routing and listings.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub session_id: String,
    pub port: u16,
    pub age_secs: u64,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, RuntimeEndpoint>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session_id: &str, endpoint: RuntimeEndpoint) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(OrchestratorError::Conflict(format!(
                "session {} already registered",
                session_id
            )));
        }
        info!(session_id, port = endpoint.port, "Session registered");
        sessions.insert(session_id.to_string(), endpoint);
        Ok(())
    }

    pub async fn lookup(&self, session_id: &str) -> Result<EndpointInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|endpoint| info_for(session_id, endpoint))
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {}", session_id)))
    }

    pub async fn list(&self) -> Vec<EndpointInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, endpoint)| info_for(id, endpoint))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    // Removal is reserved for eviction; see `EvictionScheduler`.
    pub(crate) async fn remove(&self, session_id: &str) -> Option<RuntimeEndpoint> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            info!(session_id, "Session removed from registry");
        }
        removed
    }

    pub(crate) async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

fn info_for(session_id: &str, endpoint: &RuntimeEndpoint) -> EndpointInfo {
    EndpointInfo {
        session_id: session_id.to_string(),
        port: endpoint.port,
        age_secs: endpoint.created_at.elapsed().as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogHub;
    use crate::runtime::LocalRuntime;
    use crate::supervisor::ProcessSupervisor;
    use crate::workspace::WorkspaceManager;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn endpoint(tmp: &TempDir, id: &str, port: u16) -> RuntimeEndpoint {
        let workspaces = WorkspaceManager::new(tmp.path().join("ws"), tmp.path().join("pub"));
        let sup = ProcessSupervisor::new(
            Arc::new(LocalRuntime::new("true", "sleep 30")),
            LogHub::new(),
            workspaces,
            Duration::from_secs(1),
        );
        RuntimeEndpoint::new(sup.run_service(id, tmp.path(), port).await.unwrap())
    }

    #[tokio::test]
    async fn lookup_misses_until_registered() {
        let tmp = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.lookup("r1").await,
            Err(OrchestratorError::NotFound(_))
        ));

        let ep = endpoint(&tmp, "r1", 41000).await;
        let handle = ep.handle.clone();
        registry.register("r1", ep).await.unwrap();
        assert_eq!(registry.lookup("r1").await.unwrap().port, 41000);

        handle.stop().await;
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let tmp = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        let first = endpoint(&tmp, "r1", 41001).await;
        let second = endpoint(&tmp, "r1", 41002).await;
        let handles = [first.handle.clone(), second.handle.clone()];

        registry.register("r1", first).await.unwrap();
        assert!(matches!(
            registry.register("r1", second).await,
            Err(OrchestratorError::Conflict(_))
        ));
        assert_eq!(registry.lookup("r1").await.unwrap().port, 41001);

        for handle in handles {
            handle.stop().await;
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        let ep = endpoint(&tmp, "r1", 41003).await;
        let handle = ep.handle.clone();
        registry.register("r1", ep).await.unwrap();

        assert!(registry.remove("r1").await.is_some());
        assert!(registry.remove("r1").await.is_none());
        assert!(registry.lookup("r1").await.is_err());
        assert!(registry.is_empty().await);

        handle.stop().await;
    }
}
