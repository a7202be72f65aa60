//! REST collection layout for each resource kind and response decoding.

use reqwest::StatusCode;
use serde_json::{Map, Value};

use super::auth::Service;
use crate::provider::{ProviderError, Resource, ResourceKind, ResourceSpec};

/// Where a kind lives and how its JSON envelopes are keyed.
#[derive(Clone, Copy, Debug)]
pub(super) struct Route {
    pub(super) service: Service,
    pub(super) collection: &'static str,
    pub(super) list_path: &'static str,
    pub(super) singular: &'static str,
    pub(super) plural: &'static str,
}

pub(super) const fn route(kind: ResourceKind) -> Route {
    match kind {
        ResourceKind::Router => neutron("v2.0/routers", "router", "routers"),
        ResourceKind::Network => neutron("v2.0/networks", "network", "networks"),
        ResourceKind::Subnet => neutron("v2.0/subnets", "subnet", "subnets"),
        ResourceKind::SecurityGroup => {
            neutron("v2.0/security-groups", "security_group", "security_groups")
        }
        ResourceKind::SecurityGroupRule => neutron(
            "v2.0/security-group-rules",
            "security_group_rule",
            "security_group_rules",
        ),
        ResourceKind::Keypair => nova("os-keypairs", "os-keypairs", "keypair", "keypairs"),
        ResourceKind::Server => nova("servers", "servers/detail", "server", "servers"),
        ResourceKind::FloatingIp => {
            nova("os-floating-ips", "os-floating-ips", "floating_ip", "floating_ips")
        }
        ResourceKind::Image => nova("images", "images/detail", "image", "images"),
        ResourceKind::Flavor => nova("flavors", "flavors/detail", "flavor", "flavors"),
    }
}

const fn neutron(collection: &'static str, singular: &'static str, plural: &'static str) -> Route {
    Route {
        service: Service::Network,
        collection,
        list_path: collection,
        singular,
        plural,
    }
}

const fn nova(
    collection: &'static str,
    list_path: &'static str,
    singular: &'static str,
    plural: &'static str,
) -> Route {
    Route {
        service: Service::Compute,
        collection,
        list_path,
        singular,
        plural,
    }
}

/// Kinds whose records carry no name of their own.
const fn is_nameless(kind: ResourceKind) -> bool {
    matches!(kind, ResourceKind::FloatingIp | ResourceKind::SecurityGroupRule)
}

/// Request body for creating `spec`. Floating IP allocation takes its
/// attributes unwrapped, every other kind nests them under its singular key.
pub(super) fn create_body(kind: ResourceKind, spec: &ResourceSpec) -> Value {
    let mut inner: Map<String, Value> = spec.attributes.clone();
    if kind == ResourceKind::FloatingIp {
        return Value::Object(inner);
    }
    if !is_nameless(kind) {
        inner.insert(String::from("name"), Value::String(spec.name.clone()));
    }
    let mut outer = Map::new();
    outer.insert(route(kind).singular.to_owned(), Value::Object(inner));
    Value::Object(outer)
}

fn scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Converts one provider record into a [`Resource`].
///
/// Nova wraps keypair list entries in an extra `{"keypair": …}` envelope;
/// that layer is peeled off first.
pub(super) fn decode_resource(
    kind: ResourceKind,
    value: Value,
    fallback_name: Option<&str>,
) -> Result<Resource, ProviderError> {
    let record = match value {
        Value::Object(mut map) if kind == ResourceKind::Keypair && map.contains_key("keypair") => {
            map.remove("keypair").unwrap_or(Value::Null)
        }
        other => other,
    };
    if !record.is_object() {
        return Err(ProviderError::Decode(format!("{kind} record is not an object")));
    }

    let name = match kind {
        ResourceKind::FloatingIp => scalar(record.get("ip")),
        _ => scalar(record.get("name")),
    }
    .or_else(|| fallback_name.map(str::to_owned));
    let id = match kind {
        ResourceKind::Keypair => name.clone(),
        _ => scalar(record.get("id")),
    }
    .ok_or_else(|| ProviderError::Decode(format!("{kind} record has no identifier")))?;
    let status = scalar(record.get("status"));

    Ok(Resource {
        name: name.unwrap_or_else(|| id.clone()),
        id,
        status,
        attributes: record,
    })
}

pub(super) fn decode_one(
    kind: ResourceKind,
    mut body: Value,
    fallback_name: Option<&str>,
) -> Result<Resource, ProviderError> {
    let record = body
        .get_mut(route(kind).singular)
        .map(Value::take)
        .ok_or_else(|| ProviderError::Decode(format!("missing `{}` envelope", route(kind).singular)))?;
    decode_resource(kind, record, fallback_name)
}

pub(super) fn decode_list(kind: ResourceKind, mut body: Value) -> Result<Vec<Resource>, ProviderError> {
    let plural = route(kind).plural;
    let Some(Value::Array(items)) = body.get_mut(plural).map(Value::take) else {
        return Err(ProviderError::Decode(format!("missing `{plural}` array")));
    };
    items
        .into_iter()
        .map(|item| decode_resource(kind, item, None))
        .collect()
}

/// Extracts the human message from Neutron (`{"NeutronError": {"message"}}`)
/// and Nova (`{"badRequest": {"message"}}`) error envelopes.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value.as_object().and_then(|map| {
                map.values()
                    .find_map(|inner| inner.get("message").and_then(Value::as_str))
                    .map(str::to_owned)
            })
        })
        .unwrap_or_else(|| body.trim().to_owned())
}

pub(super) fn classify(
    status: StatusCode,
    body: &str,
    kind: ResourceKind,
    id: Option<&str>,
) -> ProviderError {
    let message = error_message(body);
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            kind,
            id: id.unwrap_or_default().to_owned(),
        },
        StatusCode::CONFLICT => ProviderError::Conflict { message },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(message),
        other => ProviderError::Api {
            status: other.as_u16(),
            message,
        },
    }
}
