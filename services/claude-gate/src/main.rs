//! claude-gate
//!
//! Authenticating reverse proxy between local clients and the Anthropic
//! API. Every forwarded request carries a subscriber OAuth bearer token
//! and the system-prompt identity marker, so usage bills against the
//! subscriber's plan instead of an API key.
//!
//! Subcommands: `serve` (default) runs the proxy, `login` walks the PKCE
//! flow and stores credentials, `logout` removes them.

mod config;
mod cors;
mod login;
mod metrics;
mod models;
mod proxy;
mod transform;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use axum::Router;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use claude_auth::{DEFAULT_PROVIDER_KEY, FileStore, KeychainStore, OAuthClient, TokenStore};
use claude_provider::TokenProvider;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StorageBackend};
use crate::proxy::ProxyState;

/// TCP connect timeout for the upstream HTTP client (distinct from the
/// response-header timeout applied per request).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum idle connections per host in the upstream connection pool.
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Login,
    Logout,
}

/// Hand-rolled argv parsing: one optional subcommand plus `--config`.
fn parse_args(args: &[String]) -> Result<(Command, Option<String>)> {
    let mut command = None;
    let mut config_path = None;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(
                    iter.next()
                        .context("--config requires a path argument")?
                        .clone(),
                );
            }
            "serve" | "login" | "logout" if command.is_none() => {
                command = Some(match arg.as_str() {
                    "login" => Command::Login,
                    "logout" => Command::Logout,
                    _ => Command::Serve,
                });
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok((command.unwrap_or(Command::Serve), config_path))
}

fn build_store(config: &Config) -> Arc<dyn TokenStore> {
    match config.storage_backend {
        StorageBackend::File => Arc::new(FileStore::new(config.storage_path.clone())),
        StorageBackend::Keychain => Arc::new(KeychainStore::new()),
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler).options(preflight_handler))
        .route("/metrics", get(metrics_handler).options(preflight_handler))
        .route("/v1/models", get(models_handler).options(preflight_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (command, cli_config) = parse_args(&args)?;

    let config_path = Config::resolve_path(cli_config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    match command {
        Command::Serve => serve(config).await,
        Command::Login => login::run_login(&config, build_store(&config)).await,
        Command::Logout => login::run_logout(build_store(&config)).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!(
        bind_addr = %config.bind_addr,
        upstream_base = %config.upstream_base,
        backend = ?config.storage_backend,
        "starting claude-gate"
    );

    let prometheus = metrics::install_recorder();

    let store = build_store(&config);
    let oauth = OAuthClient::new(config.client_id.clone());
    let provider = TokenProvider::with_options(
        store,
        Arc::new(oauth),
        config.refresh_skew,
        Arc::new(claude_auth::unix_now),
    );

    // No total request timeout: streaming responses are open-ended. The
    // client performs no automatic response decompression either, so
    // compressed upstream bytes pass through to the client untouched.
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .context("failed to build HTTP client")?;

    let proxy_state = ProxyState {
        client,
        upstream_base: config.upstream_base.clone(),
        provider,
        provider_key: DEFAULT_PROVIDER_KEY.to_string(),
        requests_total: Arc::new(AtomicU64::new(0)),
        errors_total: Arc::new(AtomicU64::new(0)),
    };

    let app = build_router(AppState {
        proxy: proxy_state,
        started_at: Instant::now(),
        prometheus,
    });

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 with status, uptime, and request counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.proxy.requests_total.load(Ordering::Relaxed),
        "errors_total": state.proxy.errors_total.load(Ordering::Relaxed),
    });
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Static model listing in OpenAI shape. The upstream's own models
/// endpoint rejects OAuth bearers, so this list never proxies.
async fn models_handler(headers: HeaderMap) -> Response {
    let origin = headers.get(ORIGIN).cloned();
    let mut response = (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        models::listing().to_string(),
    )
        .into_response();
    cors::apply(response.headers_mut(), origin.as_ref());
    response
}

async fn preflight_handler(headers: HeaderMap) -> Response {
    cors::preflight(headers.get(ORIGIN))
}

/// Catch-all handler that proxies everything else upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::handle(&state.proxy, request).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
