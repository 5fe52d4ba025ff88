//! HTTP server implementation using Axum.

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::{BuildSubmitted, RunSubmitted, PREVIEW_PREFIX};
use crate::proxy;
use crate::registry::EndpointInfo;
use crate::router;
use crate::state::{AppState, FileMap};
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, State,
    },
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// How often unused reservations are swept.
const RESERVATION_SWEEP_SECS: u64 = 60;

#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Encoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Deserialize)]
struct SubmitRequest {
    project_name: String,
    files: BTreeMap<String, String>,
    #[serde(default)]
    encoding: Encoding,
}

impl SubmitRequest {
    fn into_file_map(self) -> Result<(String, FileMap)> {
        let mut files = FileMap::new();
        for (path, content) in self.files {
            let bytes = match self.encoding {
                Encoding::Utf8 => content.into_bytes(),
                Encoding::Base64 => base64::engine::general_purpose::STANDARD
                    .decode(content.as_bytes())
                    .map_err(|e| {
                        OrchestratorError::InvalidInput(format!("{}: bad base64: {}", path, e))
                    })?,
            };
            files.insert(path, bytes);
        }
        Ok((self.project_name, files))
    }
}

#[derive(Serialize)]
struct ReserveResponse {
    session_id: String,
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let previews = ServeDir::new(state.orchestrator.public_root());
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);

    Router::new()
        // Submission
        .route("/build", post(submit_build))
        .route("/run", post(submit_run))
        .route("/sessions", post(reserve_session).get(list_sessions))
        .route("/sessions/:id/build", post(submit_reserved_build))
        .route("/sessions/:id/run", post(submit_reserved_run))
        // Log stream
        .route("/logs/:id", get(logs_ws))
        // Forwarding to run sessions
        .route("/api/:id", any(forward_session))
        .route("/api/:id/*rest", any(forward_session))
        // Health check
        .route("/health", get(health))
        .nest_service(PREVIEW_PREFIX, previews)
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then evict every live session.
pub async fn run_server<F>(addr: SocketAddr, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let orchestrator = state.orchestrator.clone();
    let sweeper = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            let mut interval = interval(Duration::from_secs(RESERVATION_SWEEP_SECS));
            loop {
                interval.tick().await;
                orchestrator.expire_reservations().await;
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "Starting HTTP server on {} (runtime: {})",
        addr,
        orchestrator.runtime_name()
    );

    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await;

    sweeper.abort();
    info!("HTTP server stopped, evicting sessions");
    orchestrator.shutdown().await;
    served
}

async fn health() -> &'static str {
    "OK"
}

async fn submit_build(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<BuildSubmitted>> {
    let (project_name, files) = req.into_file_map()?;
    let out = state.orchestrator.submit_build(&project_name, files).await?;
    Ok(Json(out))
}

async fn submit_run(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<RunSubmitted>> {
    let (project_name, files) = req.into_file_map()?;
    let out = state.orchestrator.submit_run(&project_name, files).await?;
    Ok(Json(out))
}

async fn reserve_session(State(state): State<AppState>) -> Json<ReserveResponse> {
    let session_id = state.orchestrator.reserve().await;
    Json(ReserveResponse { session_id })
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<EndpointInfo>> {
    Json(state.orchestrator.live_sessions().await)
}

async fn submit_reserved_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<BuildSubmitted>> {
    let (project_name, files) = req.into_file_map()?;
    state.orchestrator.claim(&id).await?;
    let out = state
        .orchestrator
        .build_session(&id, &project_name, files)
        .await?;
    Ok(Json(out))
}

async fn submit_reserved_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<RunSubmitted>> {
    let (project_name, files) = req.into_file_map()?;
    state.orchestrator.claim(&id).await?;
    let out = state
        .orchestrator
        .run_session(&id, &project_name, files)
        .await?;
    Ok(Json(out))
}

async fn logs_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing published during the
    // handshake is missed.
    let subscription = state.orchestrator.hub().subscribe(&id);
    ws.on_upgrade(move |socket| stream_logs(socket, subscription))
}

async fn stream_logs(socket: WebSocket, mut subscription: crate::logs::Subscription) {
    let session_id = subscription.session_id().to_string();
    let (mut sender, mut receiver) = socket.split();
    debug!(session_id = %session_id, "Log stream opened");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize log event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(session_id = %session_id, "Log stream closed");
}

async fn forward_session(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request<Body>,
) -> Response {
    let Some(id) = params.get("id") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // `rest` arrives percent-decoded; forward the raw path instead.
    let sub_path = router::sub_path_of(req.uri().path()).to_string();
    let target = match state.orchestrator.router().route(id, &sub_path).await {
        Ok(target) => target,
        Err(e) => return e.into_response(),
    };
    match proxy::forward(&state.http_client, &target, req, state.max_body_bytes).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}
