//! HTTP exposition: `/metrics` (Prometheus), `/alloy-targets` (service
//! discovery JSON) and `/health`.

use agent_lib::health::HealthRegistry;
use agent_lib::{Coordinator, TargetDiscoverer};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state.
///
/// `scrape_semaphore` bounds the number of concurrent in-flight requests
/// across `/metrics` and `/alloy-targets` to `--web.max-requests`; actual
/// serialization of the scrape itself is the `Coordinator`'s own lock.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub discoverer: Option<Arc<TargetDiscoverer>>,
    pub health_registry: HealthRegistry,
    pub scrape_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        discoverer: Option<Arc<TargetDiscoverer>>,
        health_registry: HealthRegistry,
        max_requests: usize,
    ) -> Self {
        Self {
            coordinator,
            discoverer,
            health_registry,
            scrape_semaphore: Arc::new(Semaphore::new(max_requests.max(1))),
        }
    }
}

/// Prometheus metrics endpoint. Drives one coordinator scrape per request,
/// bounded by both the request semaphore and a hard scrape timeout.
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Ok(_permit) = state.scrape_semaphore.try_acquire() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            b"too many concurrent scrape requests\n".to_vec(),
        );
    };

    match tokio::time::timeout(SCRAPE_TIMEOUT, state.coordinator.scrape()).await {
        Ok(Ok(_units)) => {}
        Ok(Err(e)) => {
            warn!(error = %e, "scrape failed");
        }
        Err(_) => {
            warn!(timeout_secs = SCRAPE_TIMEOUT.as_secs(), "scrape timed out");
        }
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// `http_sd_config`-shaped service discovery feed for per-process profilers.
async fn alloy_targets(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Ok(_permit) = state.scrape_semaphore.try_acquire() else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(Vec::new())).into_response();
    };

    let Some(discoverer) = &state.discoverer else {
        return (StatusCode::NOT_FOUND, Json(Vec::new())).into_response();
    };

    match discoverer.discover().await {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => {
            warn!(error = %e, "target discovery failed");
            (StatusCode::OK, Json(Vec::new())).into_response()
        }
    }
}

/// Plain liveness probe, unconditionally healthy once the process is
/// serving requests.
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "CEEMS Exporter is healthy")
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health));

    if state.discoverer.is_some() {
        router = router.route("/alloy-targets", get(alloy_targets));
    }

    router.with_state(state)
}

pub async fn serve(listen_address: String, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %listen_address, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&listen_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
