//! Unit tests for role expansion and provisioning helpers.

use camino::Utf8Path;
use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::config::Document;
use crate::test_support::{DirectConnector, MemoryProvider, task_context};

#[fixture]
fn document() -> Document {
    let text = json!({
        "instance_name_prefix": "dns-",
        "environments": { "prod": {}, "staging": {} },
        "roles": {
            "db": {
                "image": "debian-12",
                "flavor": "b2-7",
                "keypair": "ops",
                "user": "debian",
                "security_groups": ["db"],
                "instances": {
                    "prod": [
                        { "number": 1, "az": "az2" },
                        { "number": 2, "az": "az3" }
                    ]
                }
            },
            "web": {
                "image": "ubuntu-22.04",
                "flavor": "s1-2",
                "provisioner": ["bootstrap", "--role", "{role}", "{name} in {environment}"],
                "instances": {
                    "prod": [{ "number": 1 }],
                    "staging": [{ "number": 1 }]
                }
            },
            "broken": {
                "image": "ubuntu-22.04",
                "instances": { "prod": [{ "number": 1 }] }
            }
        }
    })
    .to_string();
    Document::from_json(Utf8Path::new("roles.json"), &text).expect("document parses")
}

fn expand(document: Document, environment: &str) -> BTreeMap<String, PlannedInstance> {
    let context = task_context(
        document,
        environment,
        &MemoryProvider::new(),
        &DirectConnector::default(),
    );
    expand_roles(&context)
}

#[rstest]
fn expands_slots_of_the_selected_environment(document: Document) {
    let instances = expand(document, "prod");

    assert_eq!(
        instances.keys().map(String::as_str).collect::<Vec<_>>(),
        ["dns-prodaz1-web0001", "dns-prodaz2-db0001", "dns-prodaz3-db0002"]
    );
    let db = &instances["dns-prodaz2-db0001"];
    assert_eq!(db.role, "db");
    assert_eq!(db.az, "az2");
    assert_eq!(db.keypair.as_deref(), Some("ops"));
    assert_eq!(db.user, "debian");
    assert_eq!(db.security_groups, ["db"]);
    assert_eq!(db.provisioner_command(), None);
}

#[rstest]
fn roles_fall_back_to_default_groups_and_user(document: Document) {
    let instances = expand(document, "staging");

    assert_eq!(instances.len(), 1);
    let web = &instances["dns-stagingaz1-web0001"];
    assert_eq!(web.security_groups, ["default", "web"]);
    assert_eq!(web.user, DEFAULT_SSO_USER);
    assert_eq!(web.keypair, None);
}

#[rstest]
fn roles_without_image_or_flavor_are_skipped(document: Document) {
    let instances = expand(document, "prod");

    assert!(instances.values().all(|instance| instance.role != "broken"));
}

#[rstest]
fn unknown_environment_expands_to_nothing(document: Document) {
    assert!(expand(document, "qa").is_empty());
}

#[rstest]
fn provisioner_command_substitutes_and_escapes(document: Document) {
    let instances = expand(document, "staging");
    let web = &instances["dns-stagingaz1-web0001"];

    assert_eq!(
        web.provisioner_command().as_deref(),
        Some("bootstrap --role web 'dns-stagingaz1-web0001 in staging'")
    );
}

fn planned(nics: Vec<NicSpec>) -> PlannedInstance {
    PlannedInstance {
        name: String::from("dns-prodaz1-web0001"),
        role: String::from("web"),
        environment: String::from("prod"),
        image: String::from("ubuntu-22.04"),
        flavor: String::from("s1-2"),
        az: String::from("az1"),
        keypair: None,
        security_groups: Vec::new(),
        nics,
        user: String::from("ubuntu"),
        provisioner: None,
    }
}

fn server(addresses: serde_json::Value) -> Resource {
    let mut server = Resource::new("server-1", "dns-prodaz1-web0001");
    server.attributes = json!({ "addresses": addresses });
    server
}

#[rstest]
#[case::fixed_ip_wins(
    Some("10.0.0.5"),
    json!({ "n1": [{ "addr": "10.0.0.9" }] }),
    Some("10.0.0.5")
)]
#[case::first_reported_address(None, json!({ "n1": [{ "addr": "10.0.0.9" }] }), Some("10.0.0.9"))]
#[case::no_address(None, json!({}), None)]
fn private_address_prefers_configured_fixed_ip(
    #[case] fixed_ip: Option<&str>,
    #[case] addresses: serde_json::Value,
    #[case] expected: Option<&str>,
) {
    let nic = NicSpec {
        network: String::from("n1"),
        fixed_ip: fixed_ip.map(str::to_owned),
        floating_ip: None,
    };

    let address = private_address(&server(addresses), &planned(vec![nic]));

    assert_eq!(address.as_deref(), expected);
}
