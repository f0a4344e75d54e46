// SPDX-License-Identifier: MIT
//
// QKD LKMS: ETSI QKD 004 Local Key Management System
//
// https://github.com/yourusername/qkd-lkms

//! LKMS Daemon - Local Key Management System service
//!
//! Runs the single-threaded session reactor, the southbound key puller and
//! the northbound HTTP/JSON binding of the ETSI GS QKD 004 application
//! interface.
//!
//! # Endpoints
//!
//! - `POST /api/v1/open` - open a key stream
//! - `POST /api/v1/get_key` - fetch the next key chunk
//! - `POST /api/v1/close` - close a key stream
//! - `GET /api/v1/status` - daemon status snapshot
//! - `GET /health` - health check
//! - `GET /metrics` - Prometheus metrics

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use lkms_core::{
    config::LkmsConfig,
    link::{feed_loop, KeyLinkClient, LinkConfig},
    metrics::Metrics,
    protocol::{
        CloseRequest, CloseResponse, DaemonStatus, GetKeyRequest, GetKeyResponse, HealthStatus,
        OpenRequest, OpenResponse,
    },
    reactor::{Reactor, ReactorConfig, ReactorHandle},
    retry::CircuitBreaker,
    southbound::{self, LinkStatus},
    Error,
};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "lkmsd", version)]
#[command(about = "LKMS daemon - local key management for QKD applications", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    reactor: ReactorHandle,
    metrics: Metrics,
    link: watch::Receiver<LinkStatus>,
    start_time: Instant,
}

/// POST /api/v1/open - Open a key stream
async fn open_stream(
    State(state): State<AppState>,
    Json(request): Json<OpenRequest>,
) -> Result<Json<OpenResponse>, (StatusCode, String)> {
    match state
        .reactor
        .open(request.source, request.destination, request.qos)
        .await
    {
        Ok((key_stream_id, status)) => Ok(Json(OpenResponse {
            key_stream_id,
            status,
        })),
        // Malformed QoS is a call-level rejection, not an ETSI status.
        Err(Error::Validation(message)) => Err((StatusCode::BAD_REQUEST, message)),
        Err(e) => {
            error!("open failed: {}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "service unavailable".to_string(),
            ))
        }
    }
}

/// POST /api/v1/get_key - Fetch the next key chunk
async fn get_key(
    State(state): State<AppState>,
    Json(request): Json<GetKeyRequest>,
) -> Result<Json<GetKeyResponse>, StatusCode> {
    match state.reactor.get_key(request.key_stream_id).await {
        Ok((index, octets, status)) => Ok(Json(GetKeyResponse {
            index,
            key: hex::encode(&octets),
            status,
        })),
        Err(e) => {
            error!("get_key failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// POST /api/v1/close - Close a key stream
async fn close_stream(
    State(state): State<AppState>,
    Json(request): Json<CloseRequest>,
) -> Result<Json<CloseResponse>, StatusCode> {
    match state.reactor.close(request.key_stream_id).await {
        Ok(status) => Ok(Json(CloseResponse { status })),
        Err(e) => {
            error!("close failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// GET /api/v1/status - Daemon status snapshot
async fn get_status(State(state): State<AppState>) -> Result<Json<DaemonStatus>, StatusCode> {
    let snapshot = state
        .reactor
        .snapshot()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    let link = *state.link.borrow();
    let status = match link {
        LinkStatus::Available => HealthStatus::Healthy,
        LinkStatus::Degraded => HealthStatus::Degraded,
        LinkStatus::Unavailable => HealthStatus::Unhealthy,
    };

    let mut warnings = Vec::new();
    if link != LinkStatus::Available {
        warnings.push(format!("Southbound link is {}", link));
    }
    if snapshot.pending_requests > 0 {
        warnings.push(format!(
            "{} get_key requests waiting on key material",
            snapshot.pending_requests
        ));
    }

    Ok(Json(DaemonStatus {
        status,
        link_status: link.to_string(),
        active_sessions: snapshot.live_sessions,
        buffered_bytes: snapshot.buffered_bytes,
        observed_at: chrono::Utc::now(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        total_requests_served: state.metrics.requests_total(),
        total_bytes_delivered: state.metrics.bytes_delivered(),
        warnings,
    }))
}

/// GET /health - Simple health check
async fn health_check(State(state): State<AppState>) -> StatusCode {
    match *state.link.borrow() {
        LinkStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

/// GET /metrics - Prometheus metrics
async fn get_metrics(State(state): State<AppState>) -> String {
    state.metrics.prometheus_format()
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use futures::stream::StreamExt;
        use signal_hook::consts::signal::*;
        use signal_hook_tokio::Signals;

        let mut signals =
            Signals::new([SIGINT, SIGTERM]).expect("Failed to register signal handlers");

        if let Some(signal) = signals.next().await {
            info!("Received signal: {:?}", signal);
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C signal");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .json()
        .init();

    info!("LKMS daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config =
        LkmsConfig::from_env().context("Failed to load configuration from environment")?;
    info!("Listen address: {}", config.listen_address);
    info!("Southbound endpoint: {}", config.south_url);

    let metrics = Metrics::new();

    // Southbound plumbing: the puller feeds the reactor through a bounded
    // channel and publishes the observed link state.
    let (feed, source) = southbound::channel(config.feed_depth);
    let link_watch = feed.subscribe();
    let client = KeyLinkClient::new(LinkConfig::new(config.south_url(), config.pull_chunk_size))
        .context("Failed to build southbound client")?;
    let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
    let feeder = tokio::spawn(feed_loop(client, feed, config.pull_interval(), breaker));

    // The reactor owns every session; handlers only post commands to it.
    let (reactor, reactor_handle) = Reactor::new(ReactorConfig::from(&config), source, metrics.clone());
    let reactor_task = tokio::spawn(reactor.run());

    let state = AppState {
        reactor: reactor_handle.clone(),
        metrics,
        link: link_watch,
        start_time: Instant::now(),
    };

    // Build router
    let app = Router::new()
        .route("/api/v1/open", post(open_stream))
        .route("/api/v1/get_key", post(get_key))
        .route("/api/v1/close", post(close_stream))
        .route("/api/v1/status", get(get_status))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: std::net::SocketAddr = config
        .listen_address
        .parse()
        .context("Invalid listen address")?;
    info!("Starting northbound service on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    // Northbound is down; wipe all key material before exiting.
    info!("Shutting down, wiping key material");
    reactor_handle.shutdown().await;
    if let Err(e) = reactor_task.await {
        error!("Reactor task failed: {}", e);
    }
    feeder.abort();

    info!("LKMS daemon shut down gracefully");
    Ok(())
}
