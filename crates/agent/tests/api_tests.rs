//! Integration tests for the exporter's HTTP endpoints.
//!
//! The binary crate has no library target, so these tests reimplement the
//! same thin router `src/api.rs` builds, against a `Coordinator`/
//! `TargetDiscoverer` pair pointed at a cgroup root that doesn't exist -
//! exercising the "no data" path rather than real cgroup content.

use agent_lib::cgroup::{CgroupManager, VersionOverride};
use agent_lib::manager::{Manager, SlurmLayout};
use agent_lib::observability::{ExporterMetrics, StructuredLogger};
use agent_lib::{Coordinator, TargetDiscoverer};
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower::ServiceExt;

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
    discoverer: Arc<TargetDiscoverer>,
    scrape_semaphore: Arc<Semaphore>,
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _permit = state.scrape_semaphore.try_acquire();
    let _ = state.coordinator.scrape().await;

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

async fn alloy_targets(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let targets = state.discoverer.discover().await.unwrap_or_default();
    Json(targets)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "CEEMS Exporter is healthy")
}

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/alloy-targets", get(alloy_targets))
        .route("/health", get(health))
        .with_state(state)
}

fn test_cgroup_manager() -> CgroupManager {
    let manager = Manager::Slurm(SlurmLayout::new("/no/such/cgroupfs", "/no/such/cgroupfs"));
    CgroupManager::new(manager, VersionOverride::Auto, Vec::new())
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let cgroup_manager = test_cgroup_manager();
    let coordinator = Arc::new(Coordinator::new(
        cgroup_manager.clone(),
        "test-node",
        ExporterMetrics::new("test-node"),
        StructuredLogger::new("test-node"),
    ));
    let discoverer = Arc::new(TargetDiscoverer::new(cgroup_manager, false));

    let state = Arc::new(AppState {
        coordinator,
        discoverer,
        scrape_semaphore: Arc::new(Semaphore::new(40)),
    });
    let router = create_test_router(state.clone());

    (router, state)
}

#[tokio::test]
async fn test_health_endpoint_is_always_ok() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"CEEMS Exporter is healthy");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format_with_no_units() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("scrape_duration_seconds"));
}

#[tokio::test]
async fn test_metrics_endpoint_scrape_does_not_panic_repeatedly() {
    let (app, _state) = setup_test_app().await;

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_alloy_targets_returns_empty_json_array_with_no_units() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/alloy-targets").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let targets: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert!(targets.as_array().unwrap().is_empty());
}
