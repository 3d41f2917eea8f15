use std::sync::Arc;
use std::time::Duration;

use policycore::policycore::api::types::{ResourceKey, WatchedKind};
use policycore::policycore::controller::multiplexer::{setup, SetupError};
use policycore::policycore::controller::watch::RetryPolicy;
use policycore::policycore::k8s::in_memory::InMemoryCluster;
use policycore::policycore::observability::metrics::MetricsRegistry;
use policycore::policycore::test_support::{policy_object, wait_for_series};

fn kind(name: &str) -> WatchedKind {
    WatchedKind::new("policy.open-cluster-management.io", "v1", name)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40))
}

fn exposition(registry: &MetricsRegistry) -> String {
    String::from_utf8(registry.gather().expect("gather metrics")).expect("utf8 exposition")
}

#[tokio::test]
async fn series_follows_policy_through_update_and_delete() {
    let registry = MetricsRegistry::new();
    let cluster = Arc::new(InMemoryCluster::new());
    let policy = kind("PolicyKindA");
    let handle = setup(&[policy.clone()], &registry, cluster.clone(), cluster.as_ref())
        .expect("setup")
        .start(fast_retry());
    let key = ResourceKey::new(&policy, "ns1", "p1");

    cluster.apply(
        &policy,
        "ns1",
        "p1",
        policy_object(&policy, "ns1", "p1", Some("Compliant")),
    );
    wait_for_series(handle.gauge(), &key, Some(0)).await;
    let text = exposition(&registry);
    assert!(
        text.contains(
            r#"ocm_policy_compliance{policy_kind="PolicyKindA",policy_name="p1",policy_namespace="ns1"} 0"#
        ),
        "unexpected exposition:\n{text}"
    );

    cluster.apply(
        &policy,
        "ns1",
        "p1",
        policy_object(&policy, "ns1", "p1", Some("NonCompliant")),
    );
    wait_for_series(handle.gauge(), &key, Some(1)).await;
    assert_eq!(handle.gauge().series_count(), 1);

    cluster.delete(&policy, "ns1", "p1");
    wait_for_series(handle.gauge(), &key, None).await;
    assert!(!exposition(&registry).contains(r#"policy_name="p1""#));

    handle.shutdown().await;
}

#[tokio::test]
async fn missing_compliance_field_reports_unknown() {
    let registry = MetricsRegistry::new();
    let cluster = Arc::new(InMemoryCluster::new());
    let policy = kind("PolicyKindA");
    let handle = setup(&[policy.clone()], &registry, cluster.clone(), cluster.as_ref())
        .expect("setup")
        .start(fast_retry());

    cluster.apply(&policy, "ns1", "p2", policy_object(&policy, "ns1", "p2", None));
    cluster.apply(
        &policy,
        "ns1",
        "p3",
        policy_object(&policy, "ns1", "p3", Some("UnknownCompliancy")),
    );
    wait_for_series(handle.gauge(), &ResourceKey::new(&policy, "ns1", "p2"), Some(2)).await;
    wait_for_series(handle.gauge(), &ResourceKey::new(&policy, "ns1", "p3"), Some(2)).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn cluster_scoped_policy_has_empty_namespace_label() {
    let registry = MetricsRegistry::new();
    let cluster = Arc::new(InMemoryCluster::new());
    let policy = kind("ClusterPolicy");
    let handle = setup(&[policy.clone()], &registry, cluster.clone(), cluster.as_ref())
        .expect("setup")
        .start(fast_retry());

    cluster.apply(&policy, "", "global", policy_object(&policy, "", "global", Some("Compliant")));
    wait_for_series(handle.gauge(), &ResourceKey::new(&policy, "", "global"), Some(0)).await;
    assert!(exposition(&registry).contains(r#"policy_namespace="""#));

    handle.shutdown().await;
}

#[tokio::test]
async fn kinds_share_one_metric_family() {
    let registry = MetricsRegistry::new();
    let cluster = Arc::new(InMemoryCluster::new());
    let a = kind("PolicyKindA");
    let b = kind("PolicyKindB");
    let handle = setup(&[a.clone(), b.clone()], &registry, cluster.clone(), cluster.as_ref())
        .expect("setup")
        .start(fast_retry());

    cluster.apply(&a, "ns1", "same", policy_object(&a, "ns1", "same", Some("Compliant")));
    cluster.apply(&b, "ns1", "same", policy_object(&b, "ns1", "same", Some("NonCompliant")));
    wait_for_series(handle.gauge(), &ResourceKey::new(&a, "ns1", "same"), Some(0)).await;
    wait_for_series(handle.gauge(), &ResourceKey::new(&b, "ns1", "same"), Some(1)).await;

    let text = exposition(&registry);
    assert_eq!(text.matches("# TYPE ocm_policy_compliance gauge").count(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn transient_fetch_failure_keeps_previous_value_until_retry_succeeds() {
    let registry = MetricsRegistry::new();
    let cluster = Arc::new(InMemoryCluster::new());
    let policy = kind("PolicyKindA");
    let handle = setup(&[policy.clone()], &registry, cluster.clone(), cluster.as_ref())
        .expect("setup")
        .start(RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
    let key = ResourceKey::new(&policy, "ns1", "p1");

    cluster.apply(
        &policy,
        "ns1",
        "p1",
        policy_object(&policy, "ns1", "p1", Some("Compliant")),
    );
    wait_for_series(handle.gauge(), &key, Some(0)).await;

    cluster.fail_fetches(&policy, "ns1", "p1", 2);
    cluster.apply(
        &policy,
        "ns1",
        "p1",
        policy_object(&policy, "ns1", "p1", Some("NonCompliant")),
    );
    // The first retry is at least 100ms away; the old value must still be there.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(handle.gauge().series_value(&key), Some(0));

    wait_for_series(handle.gauge(), &key, Some(1)).await;
    handle.shutdown().await;
}

#[test]
fn empty_configuration_starts_nothing() {
    let registry = MetricsRegistry::new();
    let cluster = Arc::new(InMemoryCluster::new());

    let result = setup(&[], &registry, cluster.clone(), cluster.as_ref());
    assert!(matches!(result, Err(SetupError::NoWatchedKinds)));
    assert!(!cluster.is_subscribed(&kind("PolicyKindA")));
    let text = exposition(&registry);
    assert!(!text.contains("ocm_policy_compliance"));
}

#[test]
fn setup_fails_closed_when_a_kind_cannot_subscribe() {
    let registry = MetricsRegistry::new();
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.fail_subscriptions(&kind("PolicyKindB"));

    let result = setup(
        &[kind("PolicyKindA"), kind("PolicyKindB")],
        &registry,
        cluster.clone(),
        cluster.as_ref(),
    );
    let err = match result {
        Err(err) => err,
        Ok(_) => panic!("setup must fail"),
    };
    assert!(err.to_string().contains("PolicyKindB"), "{err}");
    assert!(matches!(err, SetupError::Subscribe { .. }));
}
