use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::reflector::store::Writer;
use serde_json::Value;
use tower::ServiceExt;

use policycore::policycore::api::types::{ComplianceCode, ResourceKey, WatchedKind};
use policycore::policycore::k8s::cache::ResourceCache;
use policycore::policycore::observability::metrics::{ComplianceGauge, MetricsRegistry};
use policycore::policycore::server::handlers::PROMETHEUS_CONTENT_TYPE;
use policycore::policycore::server::{build_router, ServerState};

async fn get(state: ServerState, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = build_router(state)
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("router response");
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    (status, content_type, body.to_vec())
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let registry = MetricsRegistry::new();
    let gauge = ComplianceGauge::register(&registry).expect("register gauge");
    let kind = WatchedKind::new("policy.example.io", "v1", "PolicyKindA");
    gauge
        .set_series(&ResourceKey::new(&kind, "ns1", "p1"), ComplianceCode::NonCompliant)
        .expect("set series");

    let (status, content_type, body) = get(ServerState::new(registry), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some(PROMETHEUS_CONTENT_TYPE));
    let text = String::from_utf8(body).expect("utf8");
    assert!(text.contains("# HELP ocm_policy_compliance The compliance status of the named policy."));
    assert!(text.contains(
        r#"ocm_policy_compliance{policy_kind="PolicyKindA",policy_name="p1",policy_namespace="ns1"} 1"#
    ));
}

#[tokio::test]
async fn readiness_waits_for_initial_list() {
    let cache = Arc::new(ResourceCache::new());
    let kind = WatchedKind::new("policy.example.io", "v1", "PolicyKindA");
    let resource =
        ApiResource::from_gvk(&GroupVersionKind::gvk("policy.example.io", "v1", "PolicyKindA"));
    let writer: Writer<DynamicObject> = Writer::new(resource.clone());
    let synced = cache
        .insert(&kind, resource, writer.as_reader())
        .expect("insert store");
    let state = ServerState::new(MetricsRegistry::new()).with_readiness(cache.clone());

    let (status, _, body) = get(state.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let report: Value = serde_json::from_slice(&body).expect("json report");
    assert_eq!(report["status"], "degraded");
    assert_eq!(report["components"][0]["name"], "cache:PolicyKindA");

    synced.store(true, std::sync::atomic::Ordering::Release);
    let (status, _, body) = get(state.clone(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_slice(&body).expect("json report");
    assert_eq!(report["status"], "ready");
}

#[tokio::test]
async fn liveness_is_always_ok() {
    let (status, _, body) = get(ServerState::new(MetricsRegistry::new()), "/livez").await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_slice(&body).expect("json report");
    assert_eq!(report["status"], "ready");
}
