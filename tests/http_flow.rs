//! End-to-end flows through the HTTP surface using the local runtime.

use axum::{extract::Request, Router};
use futures_util::StreamExt;
use previewd::config::{OrchestratorConfig, RuntimeKind};
use previewd::runtime::LocalRuntime;
use previewd::{http_server, AppState, LogEvent, LogKind, Orchestrator};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const BUILD_SCRIPT: &str =
    "echo building; mkdir -p build/web && echo '<h1>hello preview</h1>' > build/web/index.html";
const SERVICE_PORT_START: u16 = 47310;

struct Harness {
    _tmp: TempDir,
    addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    client: reqwest::Client,
}

impl Harness {
    async fn start(build_script: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let config = OrchestratorConfig {
            workspace_root: tmp.path().join("ws"),
            public_root: tmp.path().join("public"),
            runtime: RuntimeKind::Local,
            port_range_start: SERVICE_PORT_START,
            max_sessions: 4,
            stop_grace: Duration::from_secs(1),
            ..OrchestratorConfig::default()
        };
        std::fs::create_dir_all(&config.public_root).unwrap();

        let runtime = Arc::new(LocalRuntime::new(build_script, "sleep 30"));
        let orchestrator = Arc::new(Orchestrator::with_runtime(&config, runtime));
        let state = AppState::new(orchestrator.clone(), config.max_body_bytes);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, http_server::app(state)).await.unwrap();
        });

        Self {
            _tmp: tmp,
            addr,
            orchestrator,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let res = self
            .client
            .post(self.url(path))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = res.status().as_u16();
        let text = res.text().await.unwrap();
        (status, serde_json::from_str(&text).unwrap_or(Value::Null))
    }
}

#[tokio::test]
async fn reserved_build_streams_logs_and_serves_preview() {
    let h = Harness::start(BUILD_SCRIPT).await;

    let (status, reserved) = h.post("/sessions", json!({})).await;
    assert_eq!(status, 200);
    let id = reserved["session_id"].as_str().unwrap().to_string();

    let (mut ws, _) = connect_async(format!("ws://{}/logs/{}", h.addr, id))
        .await
        .unwrap();

    let (status, built) = h
        .post(
            &format!("/sessions/{}/build", id),
            json!({
                "project_name": "demo",
                "files": { "/lib/main.dart": "void main() {}" }
            }),
        )
        .await;
    assert_eq!(status, 200, "unexpected body: {}", built);
    assert_eq!(built["preview_url"], format!("/preview/{}/", id));

    let mut messages = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("log stream stalled")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            let event: LogEvent = serde_json::from_str(&text).unwrap();
            assert_eq!(event.session_id, id);
            let done = event.kind == LogKind::Exit;
            messages.push(event.message);
            if done {
                break;
            }
        }
    }
    assert!(messages.iter().any(|m| m.contains("pubspec.yaml")));
    assert!(messages.contains(&"building".to_string()));

    let page = h
        .client
        .get(h.url(built["preview_url"].as_str().unwrap()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(page.contains("hello preview"));

    // A reservation is single-use.
    let (status, _) = h
        .post(
            &format!("/sessions/{}/build", id),
            json!({ "project_name": "demo", "files": { "a.txt": "x" } }),
        )
        .await;
    assert_eq!(status, 404);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn failed_build_reports_stderr() {
    let h = Harness::start("echo 'lib/main.dart:1: syntax error' >&2; exit 1").await;

    let (status, body) = h
        .post(
            "/build",
            json!({ "project_name": "demo", "files": { "/lib/main.dart": "void main( {" } }),
        )
        .await;
    assert_eq!(status, 422);
    assert!(body["stderr"].as_str().unwrap().contains("syntax error"));
}

#[tokio::test]
async fn traversal_path_is_rejected() {
    let h = Harness::start(BUILD_SCRIPT).await;

    let (status, body) = h
        .post(
            "/build",
            json!({ "project_name": "demo", "files": { "/../../etc/passwd": "x" } }),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("Invalid input"));
}

#[tokio::test]
async fn run_session_requests_reach_backend_under_api_prefix() {
    let h = Harness::start(BUILD_SCRIPT).await;

    let (status, run) = h
        .post(
            "/run",
            json!({ "project_name": "api", "files": { "/bin/server.dart": "void main() {}" } }),
        )
        .await;
    assert_eq!(status, 200, "unexpected body: {}", run);
    let base = run["api_base_path"].as_str().unwrap().to_string();

    // Stand-in for the sandboxed backend on the port the session was given.
    let backend = TcpListener::bind(("127.0.0.1", SERVICE_PORT_START))
        .await
        .unwrap();
    tokio::spawn(async move {
        let echo = Router::new().fallback(|req: Request| async move {
            req.uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default()
        });
        axum::serve(backend, echo).await.unwrap();
    });

    let seen = h
        .client
        .get(h.url(&format!("{}/widgets?limit=2", base)))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(seen, "/api/widgets?limit=2");

    for (encoded, expected) in [
        ("/a%3Fadmin=1", "/api/a%3Fadmin=1"),
        ("/a%2Fb", "/api/a%2Fb"),
        ("/with%20space?q=%26", "/api/with%20space?q=%26"),
    ] {
        let seen = h
            .client
            .get(h.url(&format!("{}{}", base, encoded)))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(seen, expected, "encoding changed for {}", encoded);
    }

    let listing = h
        .client
        .get(h.url("/sessions"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let sessions: Value = serde_json::from_str(&listing).unwrap();
    assert_eq!(sessions.as_array().map(Vec::len), Some(1));

    h.orchestrator.shutdown().await;

    let after = h
        .client
        .get(h.url(&format!("{}/widgets", base)))
        .send()
        .await
        .unwrap();
    assert_eq!(after.status().as_u16(), 404);
}

#[tokio::test]
async fn unknown_session_is_not_forwarded() {
    let h = Harness::start(BUILD_SCRIPT).await;

    let res = h
        .client
        .get(h.url("/api/never-submitted/widgets"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 404);
}
