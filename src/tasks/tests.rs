//! Tests for the concrete tasks driven through the runner.

use camino::Utf8Path;
use rstest::rstest;
use serde_json::json;

use super::*;
use crate::config::Document;
use crate::graph::TaskGraph;
use crate::provider::ProviderError;
use crate::reconcile;
use crate::runner::{RunError, Runner};
use crate::store::Store;
use crate::task::{Phase, Task};
use crate::test_support::{DirectConnector, DirectTransport, MemoryProvider, Operation, task_context};
use crate::transport::CommandOutput;

const ENVIRONMENT: &str = "staging";

fn document(environment: serde_json::Value) -> Document {
    document_with_roles(environment, json!({}))
}

fn document_with_roles(environment: serde_json::Value, roles: serde_json::Value) -> Document {
    let text = json!({
        "environments": { ENVIRONMENT: environment },
        "roles": roles,
    })
    .to_string();
    Document::from_json(Utf8Path::new("test.json"), &text).expect("document parses")
}

fn subset(identities: &[&str]) -> Vec<TaskDescriptor> {
    registry()
        .into_iter()
        .filter(|descriptor| identities.contains(&descriptor.provides()))
        .collect()
}

fn runner(document: Document, provider: &MemoryProvider, identities: &[&str]) -> Runner {
    let context = task_context(document, ENVIRONMENT, provider, &DirectConnector::default());
    Runner::new(context, subset(identities)).expect("registry graph is valid")
}

fn create(kind: ResourceKind, name: &str) -> Operation {
    Operation::Create {
        kind,
        name: name.to_owned(),
    }
}

fn delete(kind: ResourceKind, name: &str) -> Operation {
    Operation::Delete {
        kind,
        name: name.to_owned(),
    }
}

fn networking() -> serde_json::Value {
    json!({
        "routers": { "r1": { "interfaces": ["s1"] } },
        "networks": { "n1": { "subnets": { "s1": { "cidr": "10.0.0.0/24" } } } },
    })
}

#[rstest]
fn registry_order_is_deterministic() {
    let descriptors = registry();
    let graph = TaskGraph::build(descriptors.iter().map(TaskDescriptor::declaration))
        .expect("registry graph builds");
    let order = graph.order().expect("registry graph is acyclic");
    assert_eq!(
        order.forward(),
        [
            KEYPAIR,
            ROUTER,
            NETWORK,
            SECURITY_GROUP,
            SUBNET,
            ROUTER_INTERFACE,
            BEACHHEAD,
            INSTANCE,
        ]
    );
}

#[rstest]
#[tokio::test]
async fn builds_router_network_subnet_in_dependency_order() {
    let provider = MemoryProvider::new();
    let runner = runner(document(networking()), &provider, &[ROUTER, NETWORK, SUBNET]);
    assert_eq!(runner.order().forward(), [ROUTER, NETWORK, SUBNET]);

    let summary = runner.execute().await.expect("run succeeds");

    assert_eq!(
        provider.operations(),
        [
            create(ResourceKind::Router, "r1"),
            create(ResourceKind::Network, "n1"),
            create(ResourceKind::Subnet, "s1"),
        ]
    );
    assert_eq!(summary.tasks_for(Phase::Build), [ROUTER, NETWORK, SUBNET]);
    let network = &provider.resources(ResourceKind::Network)[0];
    let subnet = &provider.resources(ResourceKind::Subnet)[0];
    assert_eq!(subnet.attribute_str("network_id"), Some(network.id.as_str()));
    assert_eq!(subnet.attribute_str("cidr"), Some("10.0.0.0/24"));
}

#[rstest]
#[tokio::test]
async fn second_run_changes_nothing() {
    let provider = MemoryProvider::new();
    let runner = runner(document(networking()), &provider, &[ROUTER, NETWORK, SUBNET]);

    runner.execute().await.expect("first run");
    let after_first = provider.operations().len();
    runner.execute().await.expect("second run");

    assert_eq!(provider.operations().len(), after_first);
}

#[rstest]
#[case("n1", &["s1", "n1", "r1"])]
#[case("Ext-Net", &["s1", "r1"])]
#[tokio::test]
async fn destroys_surplus_in_reverse_order(#[case] network: &str, #[case] deleted: &[&str]) {
    let provider = MemoryProvider::new();
    provider.seed(ResourceKind::Router, "r1");
    let seeded = provider.seed(ResourceKind::Network, network);
    provider.seed_with(ResourceKind::Subnet, "s1", json!({ "network_id": "elsewhere" }));
    let runner = runner(document(json!({})), &provider, &[ROUTER, NETWORK, SUBNET]);

    let summary = runner.execute().await.expect("run succeeds");

    let names: Vec<String> = provider
        .operations()
        .into_iter()
        .map(|operation| match operation {
            Operation::Delete { name, .. } => name,
            other => panic!("unexpected operation {other:?}"),
        })
        .collect();
    assert_eq!(names, deleted);
    assert_eq!(summary.tasks_for(Phase::Destroy), [SUBNET, NETWORK, ROUTER]);
    assert_eq!(
        provider.resources(ResourceKind::Network).len(),
        usize::from(seeded.name == "Ext-Net")
    );
}

#[rstest]
#[tokio::test]
async fn subnets_of_the_external_network_are_kept() {
    let provider = MemoryProvider::new();
    let external = provider.seed(ResourceKind::Network, "Ext-Net");
    provider.seed_with(ResourceKind::Subnet, "ext-subnet", json!({ "network_id": external.id }));
    let runner = runner(document(json!({})), &provider, &[ROUTER, NETWORK, SUBNET]);

    runner.execute().await.expect("run succeeds");

    assert!(provider.operations().is_empty());
}

#[rstest]
#[tokio::test]
async fn provider_failure_aborts_the_run() {
    let provider = MemoryProvider::new();
    provider.fail_on(
        ResourceKind::Network,
        "n1",
        ProviderError::Api {
            status: 500,
            message: String::from("quota exceeded"),
        },
    );
    let runner = runner(document(networking()), &provider, &[ROUTER, NETWORK, SUBNET]);

    let err = runner.execute().await.expect_err("network creation fails");

    assert!(
        matches!(err, RunError::Task { ref task, phase: Phase::Build, .. } if task == NETWORK),
        "unexpected error: {err}"
    );
    assert_eq!(provider.operations(), [create(ResourceKind::Router, "r1")]);
}

#[rstest]
#[tokio::test]
async fn router_interfaces_attach_once() {
    let provider = MemoryProvider::new();
    let runner = runner(
        document(networking()),
        &provider,
        &[ROUTER, NETWORK, SUBNET, ROUTER_INTERFACE],
    );

    runner.execute().await.expect("first run attaches");
    runner.execute().await.expect("already attached is benign");

    let router = &provider.resources(ResourceKind::Router)[0];
    let subnet = &provider.resources(ResourceKind::Subnet)[0];
    assert_eq!(provider.interfaces(), [(router.id.clone(), subnet.id.clone())]);
}

#[rstest]
#[tokio::test]
async fn interfaces_are_detached_before_their_router_is_destroyed() {
    let provider = MemoryProvider::new();
    let first = runner(
        document(networking()),
        &provider,
        &[ROUTER, NETWORK, SUBNET, ROUTER_INTERFACE],
    );
    first.execute().await.expect("provision");

    let teardown = runner(
        document(json!({})),
        &provider,
        &[ROUTER, NETWORK, SUBNET, ROUTER_INTERFACE],
    );
    teardown.execute().await.expect("teardown");

    assert!(provider.interfaces().is_empty());
    let tail: Vec<Operation> = provider.operations().into_iter().skip(4).collect();
    assert_eq!(
        tail,
        [
            Operation::Perform {
                kind: ResourceKind::Router,
                name: String::from("r1"),
                action: "remove router interface",
            },
            delete(ResourceKind::Subnet, "s1"),
            delete(ResourceKind::Network, "n1"),
            delete(ResourceKind::Router, "r1"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn security_groups_get_rules_and_default_survives() {
    let provider = MemoryProvider::new();
    provider.seed(ResourceKind::SecurityGroup, "default");
    provider.seed(ResourceKind::SecurityGroup, "legacy");
    let environment = json!({
        "security_groups": {
            "web": { "rules": [
                { "protocol": "tcp", "port_range_min": 80, "port_range_max": 80 },
                { "protocol": "tcp", "port_range_min": 443, "port_range_max": 443 }
            ] }
        }
    });
    let runner = runner(document(environment), &provider, &[SECURITY_GROUP]);

    runner.execute().await.expect("run succeeds");

    assert_eq!(provider.names(ResourceKind::SecurityGroup), ["default", "web"]);
    let web = provider
        .resources(ResourceKind::SecurityGroup)
        .into_iter()
        .find(|group| group.name == "web")
        .expect("web exists");
    let rules = provider.resources(ResourceKind::SecurityGroupRule);
    assert_eq!(rules.len(), 2);
    assert!(rules
        .iter()
        .all(|rule| rule.attribute_str("security_group_id") == Some(web.id.as_str())));
}

#[rstest]
#[tokio::test]
async fn keypairs_import_public_keys_and_save_generated_ones() {
    let provider = MemoryProvider::new();
    let environment = json!({
        "keypairs": {
            "imported": { "public_key": "ssh-ed25519 AAAA test" },
            "task-generated": {}
        }
    });
    let runner = runner(document(environment), &provider, &[KEYPAIR]);

    runner.execute().await.expect("run succeeds");

    assert_eq!(provider.names(ResourceKind::Keypair), ["imported", "task-generated"]);
    let key_file = crate::test_support::settings()
        .key_dir()
        .join("task-generated");
    assert!(key_file.exists(), "generated key saved to {key_file}");
    crate::transport::ssh::remove_private_key(&key_file).expect("cleanup");
}

fn compute_document(beachhead: bool) -> Document {
    let mut environment = networking();
    if beachhead {
        environment["beachhead"] = json!({ "image": "ubuntu-22.04", "flavor": "s1-2" });
    }
    let roles = json!({
        "web": {
            "image": "ubuntu-22.04",
            "flavor": "s1-2",
            "provisioner": ["provision.sh", "{name}"],
            "instances": { ENVIRONMENT: [
                { "number": 1, "nics": [{ "network": "n1", "fixed_ip": "10.0.0.5" }] }
            ] }
        }
    });
    document_with_roles(environment, roles)
}

fn catalogue() -> MemoryProvider {
    let provider = MemoryProvider::new().with_activation_polls(2);
    provider.seed(ResourceKind::Image, "ubuntu-22.04");
    provider.seed(ResourceKind::Flavor, "s1-2");
    provider
}

#[rstest]
#[tokio::test]
async fn full_run_provisions_through_the_beachhead_and_removes_it() {
    let provider = catalogue();
    let connector = DirectConnector::default();
    let context = task_context(compute_document(true), ENVIRONMENT, &provider, &connector);
    let runner = Runner::new(context, registry()).expect("registry graph is valid");

    let summary = runner.execute().await.expect("run succeeds");

    assert!(summary.skipped.is_empty());
    assert_eq!(provider.names(ResourceKind::Server), ["dns-stagingaz1-web0001"]);
    assert!(provider.resources(ResourceKind::FloatingIp).is_empty());
    assert!(provider.resources(ResourceKind::Keypair).is_empty());

    let targets = connector.targets();
    let [beachhead, instance] = targets.as_slice() else {
        panic!("expected two connections, got {targets:?}");
    };
    assert!(beachhead.host.starts_with("203.0.113."), "beachhead via {}", beachhead.host);
    let key_file = beachhead.identity.clone().expect("beachhead key");
    assert!(!key_file.exists(), "beachhead key removed");
    assert_eq!(instance.host, "127.0.0.1");
    assert_ne!(instance.port, 22);
    assert_eq!(instance.user, "ubuntu");
    assert_eq!(instance.identity.as_ref(), Some(&key_file));

    assert_eq!(
        connector.transport().commands(),
        ["provision.sh dns-stagingaz1-web0001"]
    );
    assert!(connector.sessions().iter().all(DirectTransport::is_closed));

    let server = &provider.resources(ResourceKind::Server)[0];
    let network = &provider.resources(ResourceKind::Network)[0];
    assert_eq!(
        server.attributes["networks"],
        json!([{ "uuid": network.id, "fixed_ip": "10.0.0.5" }])
    );
    assert_eq!(server.attributes["metadata"]["role"], "web");
}

#[rstest]
#[tokio::test]
async fn failing_provisioner_aborts_in_commission() {
    let provider = catalogue();
    let connector = DirectConnector::default();
    connector.transport().push_output(CommandOutput {
        code: Some(3),
        stdout: String::new(),
        stderr: String::from("no such file"),
    });
    let context = task_context(compute_document(true), ENVIRONMENT, &provider, &connector);
    let runner = Runner::new(context, registry()).expect("registry graph is valid");

    let err = runner.execute().await.expect_err("provisioner fails");

    let RunError::Task { task, phase, source } = err else {
        panic!("expected a task error, got {err}");
    };
    assert_eq!(task, INSTANCE);
    assert_eq!(phase, Phase::Commission);
    assert!(
        matches!(source, TaskError::Provisioner { code: Some(3), .. }),
        "unexpected source: {source}"
    );
}

#[rstest]
#[tokio::test]
async fn without_a_beachhead_instances_are_built_but_not_provisioned() {
    let provider = catalogue();
    let connector = DirectConnector::default();
    let context = task_context(compute_document(false), ENVIRONMENT, &provider, &connector);
    let runner = Runner::new(context, registry()).expect("registry graph is valid");

    let summary = runner.execute().await.expect("run succeeds");

    assert!(summary.skipped.contains(BEACHHEAD));
    assert_eq!(provider.names(ResourceKind::Server), ["dns-stagingaz1-web0001"]);
    assert!(connector.targets().is_empty());
}

fn foreign_servers() -> MemoryProvider {
    let provider = catalogue();
    provider.seed(ResourceKind::Server, "beachhead-0123");
    provider.seed(ResourceKind::Server, "dns-prodaz1-web0001");
    provider.seed(ResourceKind::Server, "dns-stagingaz1-web0009");
    provider
}

#[rstest]
#[tokio::test]
async fn instance_plan_partitions_every_listed_server() {
    let provider = foreign_servers();
    let context = task_context(
        compute_document(false),
        ENVIRONMENT,
        &provider,
        &DirectConnector::default(),
    );
    let mut task = InstanceTask::new(&context).expect("environment is defined");
    let mut store = Store::new();

    task.introspect(&mut store).await.expect("introspect succeeds");

    let plan = reconcile::plan(&store, INSTANCE).expect("plan published");
    assert_eq!(
        plan.to_create.iter().map(String::as_str).collect::<Vec<_>>(),
        ["dns-stagingaz1-web0001"]
    );
    assert!(plan.to_update.is_empty());
    assert_eq!(
        plan.to_destroy.iter().map(String::as_str).collect::<Vec<_>>(),
        ["beachhead-0123", "dns-prodaz1-web0001", "dns-stagingaz1-web0009"]
    );
}

#[rstest]
#[tokio::test]
async fn servers_outside_the_environment_prefix_are_never_destroyed() {
    let provider = foreign_servers();
    let context = task_context(
        compute_document(false),
        ENVIRONMENT,
        &provider,
        &DirectConnector::default(),
    );
    let runner = Runner::new(context, registry()).expect("registry graph is valid");

    runner.execute().await.expect("run succeeds");

    assert_eq!(
        provider.names(ResourceKind::Server),
        ["beachhead-0123", "dns-prodaz1-web0001", "dns-stagingaz1-web0001"]
    );
    let operations = provider.operations();
    assert!(operations.contains(&delete(ResourceKind::Server, "dns-stagingaz1-web0009")));
    for protected in ["beachhead-0123", "dns-prodaz1-web0001"] {
        assert!(
            !operations.contains(&delete(ResourceKind::Server, protected)),
            "{protected} was deleted"
        );
    }
}
