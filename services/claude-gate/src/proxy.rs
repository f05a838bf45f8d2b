//! HTTP proxy logic
//!
//! Receives inbound requests, resolves an authorization context, rewrites
//! headers and body, and forwards to the upstream API. Upstream responses
//! stream back chunk by chunk; Server-Sent Events pass through with no
//! buffering. Upstream error statuses are returned verbatim.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, ORIGIN};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use claude_auth::StoreError;
use claude_provider::{AuthError, TokenProvider};
use futures::TryStreamExt;
use tracing::{error, instrument, warn};

use crate::transform::{
    MESSAGES_PATH, inject_identity_prompt, is_hop_by_hop, normalize_path, outbound_headers,
};
use crate::{cors, metrics};

/// Largest request body the gateway will buffer for rewriting.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// How long to wait for upstream response headers. The body itself is
/// unbounded: streaming completions run for minutes.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared state passed to the proxy handler via the axum State extractor.
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_base: String,
    pub provider: TokenProvider,
    pub provider_key: String,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error response in the upstream's error envelope shape.
fn json_error(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

/// Map a token provisioning failure onto the client-facing response.
fn auth_error_response(err: AuthError) -> Response {
    match err {
        AuthError::LoginRequired => {
            metrics::record_upstream_error("login_required");
            json_error(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "not authenticated; run `claude-gate login` and retry",
            )
        }
        AuthError::Transport(reason) => {
            metrics::record_upstream_error("token_transport");
            json_error(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("token refresh failed: {reason}"),
            )
        }
        AuthError::Upstream(reason) => {
            metrics::record_upstream_error("token_upstream");
            json_error(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("token refresh failed: {reason}"),
            )
        }
        AuthError::Storage(StoreError::Corrupt(reason)) => {
            metrics::record_upstream_error("storage_corrupt");
            error!(%reason, "credential storage is corrupt");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "credential storage is corrupt; back up the auth file and run `claude-gate login` again",
            )
        }
        AuthError::Storage(reason) => {
            metrics::record_upstream_error("storage_io");
            error!(%reason, "credential storage failure");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                &format!("credential storage failure: {reason}"),
            )
        }
    }
}

/// Proxy one inbound request. Preflights short-circuit; everything else
/// is forwarded and gets the CORS header set on the way out.
pub async fn handle(state: &ProxyState, request: Request<Body>) -> Response {
    let origin = request.headers().get(ORIGIN).cloned();
    if request.method() == Method::OPTIONS {
        return cors::preflight(origin.as_ref());
    }

    let started = Instant::now();
    let method = request.method().to_string();
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    let mut response = forward(state, request, request_id).await;
    cors::apply(response.headers_mut(), origin.as_ref());
    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
async fn forward(state: &ProxyState, request: Request<Body>, request_id: String) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let ctx = match state.provider.authorization_context(&state.provider_key).await {
        Ok(ctx) => ctx,
        Err(err) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "authorization context unavailable");
            return auth_error_response(err);
        }
    };

    let (parts, body) = request.into_parts();
    let path = normalize_path(parts.uri.path()).to_string();
    let upstream_url = match parts.uri.query() {
        Some(query) => format!(
            "{}{}?{}",
            state.upstream_base.trim_end_matches('/'),
            path,
            query
        ),
        None => format!("{}{}", state.upstream_base.trim_end_matches('/'), path),
    };

    let headers = match outbound_headers(&parts.headers, &ctx) {
        Ok(headers) => headers,
        Err(reason) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(%reason, "failed to build outbound headers");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &reason,
            );
        }
    };

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(err) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            return json_error(
                StatusCode::BAD_REQUEST,
                "proxy_error",
                &format!("invalid request body: {err}"),
            );
        }
    };

    // Only messages requests carry a rewritable prompt; other paths
    // forward their bodies untouched.
    let body_bytes = if path == MESSAGES_PATH {
        match inject_identity_prompt(&body_bytes) {
            Some(rewritten) => rewritten.into(),
            None => body_bytes,
        }
    } else {
        body_bytes
    };

    let outbound = state
        .client
        .request(parts.method, &upstream_url)
        .headers(headers)
        .body(body_bytes);

    // Bound the wait for response headers only; the body stream that
    // follows may outlive any fixed timeout.
    let upstream = match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, outbound.send()).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(err)) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error("upstream_unreachable");
            error!(error = %err, "upstream request failed");
            return json_error(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("upstream request failed: {err}"),
            );
        }
        Err(_) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error("header_timeout");
            error!("timed out waiting for upstream response headers");
            return json_error(
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_error",
                &format!(
                    "no response headers from upstream within {}s",
                    RESPONSE_HEADER_TIMEOUT.as_secs()
                ),
            );
        }
    };

    let status = upstream.status();
    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }

    // Stream the body through without buffering: each upstream chunk is
    // written to the client as soon as it arrives, which preserves SSE
    // event pacing. Dropping this stream (client disconnect) cancels the
    // upstream request; a mid-stream upstream error terminates the
    // connection without injecting an error body, since the status line
    // is already on the wire.
    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    response
        .body(Body::from_stream(stream))
        .unwrap_or_else(|err| {
            error!(error = %err, "failed to assemble response");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {err}"),
            )
        })
}
