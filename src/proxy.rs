//! HTTP forwarding to a session's backend on localhost.

use crate::router::ForwardTarget;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, Request, Response, StatusCode},
};
use std::time::Duration;
use tracing::{debug, error, warn};

/// How long connection failures are retried while a service boots.
const STARTUP_WINDOW: Duration = Duration::from_secs(15);

const HOP_BY_HOP: [HeaderName; 5] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forward `req` to `target`, keeping method, headers, body and query.
pub async fn forward(
    client: &reqwest::Client,
    target: &ForwardTarget,
    req: Request<Body>,
    max_body_bytes: usize,
) -> Result<Response<Body>, StatusCode> {
    let mut url = format!("http://127.0.0.1:{}{}", target.port, target.path);
    if let Some(query) = req.uri().query() {
        url.push('?');
        url.push_str(query);
    }

    let (parts, body) = req.into_parts();
    enforce_body_limit(&parts.headers, max_body_bytes)?;
    let body = axum::body::to_bytes(body, max_body_bytes)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to buffer forwarded body");
            StatusCode::PAYLOAD_TOO_LARGE
        })?;
    let headers = strip_hop_by_hop(&parts.headers);

    debug!(%url, method = %parts.method, "Forwarding request");

    let start = tokio::time::Instant::now();
    let mut attempts: u64 = 0;
    let upstream = loop {
        attempts += 1;
        let result = client
            .request(parts.method.clone(), &url)
            .headers(headers.clone())
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(res) => break res,
            Err(err) if err.is_connect() && start.elapsed() < STARTUP_WINDOW => {
                let backoff = Duration::from_millis(attempts.min(10) * 100);
                debug!(attempts, error = %err, "Backend not ready, retrying in {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                error!(%url, error = %err, "Forwarded request failed");
                return Err(if err.is_connect() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                });
            }
        }
    };

    let status = upstream.status();
    let upstream_headers = strip_hop_by_hop(upstream.headers());
    let bytes = upstream.bytes().await.map_err(|e| {
        error!(error = %e, "Failed to read backend response");
        StatusCode::BAD_GATEWAY
    })?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = upstream_headers;
    Ok(response)
}

fn enforce_body_limit(headers: &HeaderMap, max_body_bytes: usize) -> Result<(), StatusCode> {
    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or(StatusCode::BAD_REQUEST)?;
        if length > max_body_bytes {
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
    }
    Ok(())
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out
}
