//! Time-boxed reclamation of every session's resources.
//!
//! Each armed session holds a one-shot entry. Whoever removes that entry
//! first (the timer, an explicit eviction, or shutdown) performs the
//! release; every other trigger observes a no-op.

use crate::ports::PortAllocator;
use crate::registry::SessionRegistry;
use crate::state::SessionKind;
use crate::supervisor::ProcessSupervisor;
use crate::workspace::WorkspaceManager;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

struct Armed {
    kind: SessionKind,
    // Dropping this cancels the pending timer.
    _cancel: oneshot::Sender<()>,
}

struct Inner {
    ttl: Duration,
    armed: Mutex<HashMap<String, Armed>>,
    registry: SessionRegistry,
    workspaces: WorkspaceManager,
    ports: Arc<PortAllocator>,
    supervisor: Arc<ProcessSupervisor>,
    closed: AtomicBool,
    // Releases hold a read guard; shutdown takes the write side to wait
    // for releases already in flight.
    in_flight: RwLock<()>,
}

#[derive(Clone)]
pub struct EvictionScheduler {
    inner: Arc<Inner>,
}

impl EvictionScheduler {
    pub fn new(
        ttl: Duration,
        registry: SessionRegistry,
        workspaces: WorkspaceManager,
        ports: Arc<PortAllocator>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ttl,
                armed: Mutex::new(HashMap::new()),
                registry,
                workspaces,
                ports,
                supervisor,
                closed: AtomicBool::new(false),
                in_flight: RwLock::new(()),
            }),
        }
    }

    /// Start the session's single-shot lifetime timer.
    ///
    /// After shutdown has begun the session is released immediately.
    pub async fn arm(&self, session_id: &str, kind: SessionKind) {
        if self.inner.closed.load(Ordering::SeqCst) {
            warn!(session_id, "Armed after shutdown, releasing now");
            self.release(session_id, kind).await;
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let previous = self.lock_armed().insert(
            session_id.to_string(),
            Armed {
                kind,
                _cancel: cancel_tx,
            },
        );
        if previous.is_some() {
            warn!(session_id, "Session re-armed; previous timer cancelled");
        }

        let scheduler = self.clone();
        let id = session_id.to_string();
        let ttl = self.inner.ttl;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ttl) => {
                    info!(session_id = %id, "Session lifetime expired");
                    scheduler.evict(&id).await;
                }
                _ = cancel_rx => {
                    debug!(session_id = %id, "Eviction timer cancelled");
                }
            }
        });
        debug!(session_id, ?kind, ttl_secs = ttl.as_secs(), "Eviction armed");
    }

    /// Release a session now. Returns `false` if it was not armed (already
    /// evicted, or never armed).
    pub async fn evict(&self, session_id: &str) -> bool {
        let Some(armed) = self.lock_armed().remove(session_id) else {
            return false;
        };
        self.release(session_id, armed.kind).await;
        true
    }

    pub fn is_armed(&self, session_id: &str) -> bool {
        self.lock_armed().contains_key(session_id)
    }

    /// Evict everything and wait until every release has finished.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let drained: Vec<(String, Armed)> = self.lock_armed().drain().collect();
        info!(sessions = drained.len(), "Evicting all sessions");
        join_all(
            drained
                .iter()
                .map(|(id, armed)| self.release(id, armed.kind)),
        )
        .await;

        // Registered but never armed: release anyway.
        let leftovers = self.inner.registry.session_ids().await;
        join_all(
            leftovers
                .iter()
                .map(|id| self.release(id, SessionKind::Run)),
        )
        .await;

        let _barrier = self.inner.in_flight.write().await;
        info!("Eviction sweep complete");
    }

    async fn release(&self, session_id: &str, kind: SessionKind) {
        let _guard = self.inner.in_flight.read().await;
        match kind {
            SessionKind::Build => {
                self.blocking_cleanup(session_id, |ws, id| ws.destroy_artifact(id))
                    .await;
            }
            SessionKind::Run => {
                // Unroutable first, then stop, then hand the port back.
                if let Some(endpoint) = self.inner.registry.remove(session_id).await {
                    self.inner.supervisor.stop(&endpoint.handle).await;
                    self.inner.ports.release(endpoint.port);
                }
                self.blocking_cleanup(session_id, |ws, id| ws.destroy(id))
                    .await;
            }
        }
        info!(session_id, ?kind, "Session evicted");
    }

    async fn blocking_cleanup<F>(&self, session_id: &str, op: F)
    where
        F: FnOnce(&WorkspaceManager, &str) -> crate::error::Result<()> + Send + 'static,
    {
        let workspaces = self.inner.workspaces.clone();
        let id = session_id.to_string();
        match tokio::task::spawn_blocking(move || op(&workspaces, &id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id, error = %e, "Cleanup failed"),
            Err(e) => warn!(session_id, error = %e, "Cleanup task failed"),
        }
    }

    fn lock_armed(&self) -> std::sync::MutexGuard<'_, HashMap<String, Armed>> {
        self.inner
            .armed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogHub;
    use crate::registry::RuntimeEndpoint;
    use crate::runtime::LocalRuntime;
    use crate::state::FileMap;
    use crate::supervisor::ServiceHandle;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        registry: SessionRegistry,
        workspaces: WorkspaceManager,
        ports: Arc<PortAllocator>,
        supervisor: Arc<ProcessSupervisor>,
        scheduler: EvictionScheduler,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let workspaces = WorkspaceManager::new(tmp.path().join("ws"), tmp.path().join("pub"));
        let registry = SessionRegistry::new();
        let ports = Arc::new(PortAllocator::new(42000, 8));
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::new(LocalRuntime::new("true", "sleep 30")),
            LogHub::new(),
            workspaces.clone(),
            Duration::from_secs(1),
        ));
        let scheduler = EvictionScheduler::new(
            ttl,
            registry.clone(),
            workspaces.clone(),
            ports.clone(),
            supervisor.clone(),
        );
        Fixture {
            _tmp: tmp,
            registry,
            workspaces,
            ports,
            supervisor,
            scheduler,
        }
    }

    async fn start_run(fx: &Fixture, id: &str) -> Arc<ServiceHandle> {
        let mut files = FileMap::new();
        files.insert("bin/server.dart".into(), b"void main() {}".to_vec());
        let ws = fx
            .workspaces
            .materialize(id, &files, SessionKind::Run)
            .unwrap()
            .path;
        let port = fx.ports.allocate().unwrap();
        let handle = fx.supervisor.run_service(id, &ws, port).await.unwrap();
        let endpoint = RuntimeEndpoint::new(handle);
        let handle = endpoint.handle.clone();
        fx.registry.register(id, endpoint).await.unwrap();
        fx.scheduler.arm(id, SessionKind::Run).await;
        handle
    }

    #[tokio::test]
    async fn timer_expiry_releases_run_session() {
        let fx = fixture(Duration::from_millis(100));
        let handle = start_run(&fx, "t1").await;
        assert_eq!(fx.ports.available(), 7);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(fx.registry.lookup("t1").await.is_err());
        assert!(handle.is_stopped());
        assert_eq!(fx.ports.available(), 8);
        assert!(!fx.workspaces.workspace_path("t1").exists());
        assert!(!fx.scheduler.is_armed("t1"));
    }

    #[tokio::test]
    async fn concurrent_evictions_release_once() {
        let fx = fixture(Duration::from_secs(3600));
        let handle = start_run(&fx, "t2").await;

        let (a, b) = tokio::join!(fx.scheduler.evict("t2"), fx.scheduler.evict("t2"));
        assert!(a ^ b);
        assert!(handle.is_stopped());
        assert!(!handle.stop().await, "process must already be stopped");
        assert!(fx.registry.lookup("t2").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_every_run_session() {
        let fx = fixture(Duration::from_secs(3600));
        let first = start_run(&fx, "t3").await;
        let second = start_run(&fx, "t4").await;

        fx.scheduler.shutdown().await;

        assert!(first.is_stopped());
        assert!(second.is_stopped());
        assert!(fx.registry.is_empty().await);
        assert_eq!(fx.ports.available(), 8);
        assert!(!fx.scheduler.evict("t3").await);
    }

    #[tokio::test]
    async fn build_eviction_deletes_artifact() {
        let fx = fixture(Duration::from_secs(3600));
        let artifact = fx.workspaces.artifact_path("t5");
        std::fs::create_dir_all(&artifact).unwrap();
        std::fs::write(artifact.join("index.html"), "x").unwrap();

        fx.scheduler.arm("t5", SessionKind::Build).await;
        assert!(fx.scheduler.evict("t5").await);
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn arming_after_shutdown_releases_immediately() {
        let fx = fixture(Duration::from_secs(3600));
        fx.scheduler.shutdown().await;

        let artifact = fx.workspaces.artifact_path("t6");
        std::fs::create_dir_all(&artifact).unwrap();
        fx.scheduler.arm("t6", SessionKind::Build).await;

        assert!(!artifact.exists());
        assert!(!fx.scheduler.is_armed("t6"));
    }
}
