//! Tests for provider value types and status polling.

use std::time::Duration;

use rstest::rstest;
use serde_json::json;

use super::*;
use crate::test_support::MemoryProvider;

fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(200))
}

#[rstest]
#[case(ResourceKind::Router, "router")]
#[case(ResourceKind::SecurityGroupRule, "security group rule")]
#[case(ResourceKind::FloatingIp, "floating ip")]
fn resource_kind_display(#[case] kind: ResourceKind, #[case] expected: &str) {
    assert_eq!(kind.to_string(), expected);
}

#[rstest]
fn spec_builder_skips_absent_values() {
    let spec = ResourceSpec::new("web")
        .with("flavor", "m1.small")
        .with_optional("key_name", None::<String>)
        .with_optional("image", Some("ubuntu"));
    assert_eq!(spec.attribute_str("flavor"), Some("m1.small"));
    assert_eq!(spec.attribute_str("image"), Some("ubuntu"));
    assert!(!spec.attributes.contains_key("key_name"));
}

#[rstest]
fn resource_attribute_lookup() {
    let mut resource = Resource::new("id-1", "net");
    resource.attributes = json!({ "cidr": "10.0.0.0/24", "ip_version": 4 });
    assert_eq!(resource.attribute_str("cidr"), Some("10.0.0.0/24"));
    assert_eq!(resource.attribute_str("ip_version"), None);
}

#[rstest]
#[case(ProviderError::Conflict { message: String::from("Router Already Has A Port") }, true)]
#[case(ProviderError::Api { status: 400, message: String::from("router already has a port on subnet") }, true)]
#[case(ProviderError::Auth(String::from("already has a port")), false)]
fn mentions_only_inspects_api_messages(#[case] error: ProviderError, #[case] expected: bool) {
    assert_eq!(error.mentions("already has a port"), expected);
}

#[rstest]
fn error_predicates() {
    let missing = ProviderError::NotFound {
        kind: ResourceKind::Server,
        id: String::from("x"),
    };
    assert!(missing.is_not_found());
    assert!(!missing.is_conflict());
}

#[tokio::test]
async fn wait_returns_once_active() {
    let provider = MemoryProvider::new().with_activation_polls(3);
    let server = provider
        .create(ResourceKind::Server, &ResourceSpec::new("web"))
        .await
        .expect("create server");
    assert_eq!(server.status.as_deref(), Some("BUILD"));

    let active = fast_policy()
        .wait_for_status(&provider, ResourceKind::Server, &server.id, "ACTIVE")
        .await
        .expect("server becomes active");
    assert_eq!(active.status.as_deref(), Some("ACTIVE"));
}

#[tokio::test]
async fn wait_with_an_unrepresentable_deadline_still_polls() {
    let provider = MemoryProvider::new().with_activation_polls(3);
    let server = provider
        .create(ResourceKind::Server, &ResourceSpec::new("web"))
        .await
        .expect("create server");

    let active = RetryPolicy::new(Duration::from_millis(1), Duration::MAX)
        .wait_for_status(&provider, ResourceKind::Server, &server.id, "ACTIVE")
        .await
        .expect("server becomes active");
    assert_eq!(active.status.as_deref(), Some("ACTIVE"));
}

#[tokio::test]
async fn wait_fails_fast_on_error_status() {
    let provider = MemoryProvider::new();
    let server = provider.seed(ResourceKind::Server, "web");
    provider.set_status(ResourceKind::Server, &server.id, "ERROR");

    let err = fast_policy()
        .wait_for_status(&provider, ResourceKind::Server, &server.id, "ACTIVE")
        .await
        .expect_err("error status aborts the wait");
    assert!(matches!(err, ProviderError::Failed { ref status, .. } if status == "ERROR"));
}

#[tokio::test]
async fn wait_times_out_when_status_never_changes() {
    let provider = MemoryProvider::new();
    let server = provider.seed(ResourceKind::Server, "web");
    provider.set_status(ResourceKind::Server, &server.id, "BUILD");

    let err = fast_policy()
        .wait_for_status(&provider, ResourceKind::Server, &server.id, "ACTIVE")
        .await
        .expect_err("deadline elapses");
    assert!(matches!(err, ProviderError::Timeout { ref wanted, .. } if wanted == "ACTIVE"));
}

#[tokio::test]
async fn wait_propagates_missing_resource() {
    let provider = MemoryProvider::new();
    let err = fast_policy()
        .wait_for_status(&provider, ResourceKind::Server, "gone", "ACTIVE")
        .await
        .expect_err("missing server");
    assert!(err.is_not_found());
}
