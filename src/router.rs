//! Resolution of session-addressed requests to live backend endpoints.

use crate::error::Result;
use crate::registry::SessionRegistry;
use tracing::debug;

/// Public prefix of forwarded requests: `/api/<session_id>/...`.
pub const ROUTE_PREFIX: &str = "/api";

/// Base path the backend service itself serves under.
pub const BACKEND_BASE_PATH: &str = "/api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub port: u16,
    pub path: String,
}

pub fn api_base_path(session_id: &str) -> String {
    format!("{}/{}", ROUTE_PREFIX, session_id)
}

/// Remainder of a raw `/api/<id>/...` request path after the session
/// segment. Percent-encoding is left untouched.
pub fn sub_path_of(request_path: &str) -> &str {
    let rest = request_path
        .strip_prefix(ROUTE_PREFIX)
        .unwrap_or(request_path);
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "",
    }
}

/// `"/widgets"` -> `"/api/widgets"`; empty -> `"/api"`.
pub fn rewrite_path(sub_path: &str) -> String {
    let trimmed = sub_path.trim_start_matches('/');
    if trimmed.is_empty() {
        BACKEND_BASE_PATH.to_string()
    } else {
        format!("{}/{}", BACKEND_BASE_PATH, trimmed)
    }
}

/// Stateless: every call consults the registry, nothing is cached.
#[derive(Clone)]
pub struct SessionRouter {
    registry: SessionRegistry,
}

impl SessionRouter {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub async fn route(&self, session_id: &str, sub_path: &str) -> Result<ForwardTarget> {
        let endpoint = self.registry.lookup(session_id).await.inspect_err(|_| {
            debug!(session_id, "No live endpoint for session");
        })?;
        Ok(ForwardTarget {
            port: endpoint.port,
            path: rewrite_path(sub_path),
        })
    }
}
