//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUILD_IMAGE: &str = "ghcr.io/cirruslabs/flutter:stable";
pub const DEFAULT_SERVICE_IMAGE: &str = "dart:stable";
pub const DEFAULT_BUILD_SCRIPT: &str = "flutter pub get && flutter build web";
pub const DEFAULT_SERVICE_SCRIPT: &str = "dart pub get && dart run bin/server.dart";

/// Port the service listens on inside its sandbox.
pub const SERVICE_CONTAINER_PORT: u16 = 8080;

/// Session lifetime after a successful build or service start (1 hour).
pub const SESSION_TTL_SECS: u64 = 3600;

/// Unused reservations are dropped after this long (5 minutes).
pub const RESERVATION_TTL_SECS: u64 = 300;

/// Which sandbox backend launches build and service processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RuntimeKind {
    Docker,
    /// Plain `sh -c` in the workspace. No isolation.
    Local,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workspace_root: PathBuf,
    pub public_root: PathBuf,
    pub runtime: RuntimeKind,
    pub build_image: String,
    pub service_image: String,
    pub build_script: String,
    pub service_script: String,
    pub port_range_start: u16,
    pub max_sessions: u16,
    pub session_ttl: Duration,
    pub reservation_ttl: Duration,
    pub stop_grace: Duration,
    pub max_body_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/tmp/previewd/workspaces"),
            public_root: PathBuf::from("/tmp/previewd/public"),
            runtime: RuntimeKind::Docker,
            build_image: DEFAULT_BUILD_IMAGE.to_string(),
            service_image: DEFAULT_SERVICE_IMAGE.to_string(),
            build_script: DEFAULT_BUILD_SCRIPT.to_string(),
            service_script: DEFAULT_SERVICE_SCRIPT.to_string(),
            port_range_start: 9000,
            max_sessions: 256,
            session_ttl: Duration::from_secs(SESSION_TTL_SECS),
            reservation_ttl: Duration::from_secs(RESERVATION_TTL_SECS),
            stop_grace: Duration::from_secs(5),
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}
