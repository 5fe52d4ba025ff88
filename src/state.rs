//! Shared application state and session types.

use crate::orchestrator::Orchestrator;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Caller-relative path to file content.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Whether a session produces a static artifact or a long-lived service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Build,
    Run,
}

/// Session ids handed out ahead of submission so observers can subscribe
/// to logs before the pipeline starts.
pub type Reservations = Arc<RwLock<HashMap<String, Instant>>>;

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub http_client: reqwest::Client,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, max_body_bytes: usize) -> Self {
        Self {
            orchestrator,
            http_client: reqwest::Client::new(),
            max_body_bytes,
        }
    }
}
