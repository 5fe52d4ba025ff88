//! previewd - ephemeral build/run sessions in disposable sandboxes.
//!
//! Submitted files are written to a private workspace, built or run by a
//! sandbox runtime, and exposed either as a static preview or through a
//! session-scoped forwarding prefix until the session is evicted.

#[cfg(not(unix))]
compile_error!("previewd only works on Unix-like systems.");

pub mod config;
pub mod error;
pub mod eviction;
pub mod http_server;
pub mod logs;
pub mod orchestrator;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod scaffold;
pub mod state;
pub mod supervisor;
pub mod workspace;

pub use config::{OrchestratorConfig, RuntimeKind};
pub use error::{OrchestratorError, Result};
pub use logs::{LogEvent, LogHub, LogKind};
pub use orchestrator::Orchestrator;
pub use state::AppState;
