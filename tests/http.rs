//! HTTP surface over the fixture data source

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use kafka_lens::batch::BatchConfig;
use kafka_lens::cache::ResultCache;
use kafka_lens::executor::{QueryExecutor, RetryPolicy};
use kafka_lens::facade::{MetricsOrchestrator, TtlPolicy};
use kafka_lens::health::{health_request, HealthCalculator};
use kafka_lens::models::{EntityKind, EntityQuery, Filter, Provider, TimeWindow};
use kafka_lens::routes;
use kafka_lens::services::FixtureService;
use kafka_lens::state::AppState;

fn app() -> Router {
    let service = Arc::new(FixtureService::demo());
    let executor = Arc::new(QueryExecutor::new(
        service.clone(),
        service,
        RetryPolicy::default(),
        1,
    ));
    let orchestrator = MetricsOrchestrator::new(
        Provider::AwsMsk,
        Arc::new(ResultCache::new(50)),
        executor,
        HealthCalculator::new(),
        BatchConfig::default(),
        TtlPolicy::default(),
    );
    routes::router(AppState::new(orchestrator, "fixture"))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_health_and_ready() {
    let app = app();

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");

    let (status, body) = send(&app, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ready");
    assert_eq!(json["checks"]["cache"]["message"], "0/50 entries");
}

#[tokio::test(start_paused = true)]
async fn test_metric_view_carries_health() {
    let app = app();
    let request = health_request(EntityKind::Cluster, TimeWindow::last_seconds(300))
        .filter(Filter::eq("clusterName", "prod-kafka"));

    let (status, body) = send(&app, post_json("/api/v1/metrics", &request)).await;

    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["loading"], false);
    assert!(json["error"].is_null());
    assert_eq!(json["data"]["groups"][0]["health"]["overall"], 100);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_view_reports_error_state() {
    let app = app();
    let body = json!({
        "entityKind": "topic",
        "metrics": []
    });

    let (status, body) = send(&app, post_json("/api/v1/metrics", &body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["kind"], "invalid_descriptor");
    assert!(json["data"].is_null());
}

#[tokio::test(start_paused = true)]
async fn test_entities_then_invalidate() {
    let app = app();
    let query = EntityQuery::new(EntityKind::Topic).filter(Filter::eq("clusterName", "prod-kafka"));

    let (status, body) = send(&app, post_json("/api/v1/entities", &query)).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["data"]["count"], 2);

    let invalidate = json!({ "tags": ["cluster:prod-kafka"] });
    let (status, body) = send(&app, post_json("/api/v1/cache/invalidate", &invalidate)).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["evicted"], 1);

    let (status, _) = send(&app, post_json("/api/v1/cache/invalidate", &json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&app, get("/metrics")).await;
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("kafkalens_requests_total{endpoint=\"entities\"} 1"));
    assert!(text.contains("kafkalens_failed_requests_total 0"));
}
