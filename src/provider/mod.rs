//! Cloud provider abstraction consumed by the concrete tasks.
//!
//! Every resource kind supports the same small surface: list, get, create,
//! delete, plus a handful of kind-specific actions such as attaching a router
//! interface. Resources are opaque records exposing an id and a name; the
//! remaining provider fields travel in [`Resource::attributes`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

pub mod openstack;
mod wait;

pub use openstack::{OpenStackProvider, ServiceCatalog};
pub use wait::RetryPolicy;

/// Resource kinds the tasks reconcile.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// Neutron router.
    Router,
    /// Neutron network.
    Network,
    /// Neutron subnet.
    Subnet,
    /// Neutron security group.
    SecurityGroup,
    /// Rule belonging to a security group.
    SecurityGroupRule,
    /// Nova keypair; the name doubles as the id.
    Keypair,
    /// Nova server.
    Server,
    /// Floating IP; the address doubles as the name.
    FloatingIp,
    /// Boot image (read only).
    Image,
    /// Server flavor (read only).
    Flavor,
}

impl ResourceKind {
    /// Lower-case label used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "security group",
            Self::SecurityGroupRule => "security group rule",
            Self::Keypair => "keypair",
            Self::Server => "server",
            Self::FloatingIp => "floating ip",
            Self::Image => "image",
            Self::Flavor => "flavor",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-side record of an existing resource.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Human-readable name used for reconciliation.
    pub name: String,
    /// Lifecycle status when the kind reports one (for example `ACTIVE`).
    pub status: Option<String>,
    /// Remaining provider fields.
    pub attributes: Value,
}

impl Resource {
    /// Creates a resource with no extra attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: None,
            attributes: Value::Object(Map::new()),
        }
    }

    /// Returns a string attribute by key.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Request body for [`Provider::create`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceSpec {
    /// Name of the resource to create.
    pub name: String,
    /// Kind-specific fields sent alongside the name.
    pub attributes: Map<String, Value>,
}

impl ResourceSpec {
    /// Starts a spec for a resource called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Map::new(),
        }
    }

    /// Sets an attribute, replacing any previous value.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_owned(), value.into());
        self
    }

    /// Sets an attribute when `value` is present.
    #[must_use]
    pub fn with_optional(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(inner) => self.with(key, inner),
            None => self,
        }
    }

    /// Returns a string attribute by key.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Kind-specific mutations beyond create and delete.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceAction {
    /// Attach a subnet to a router.
    AddRouterInterface {
        /// Subnet to attach.
        subnet_id: String,
    },
    /// Detach a subnet from a router.
    RemoveRouterInterface {
        /// Subnet to detach.
        subnet_id: String,
    },
    /// Associate a floating IP with a server.
    AddFloatingIp {
        /// Floating address to attach.
        address: String,
        /// Fixed address on the server to map onto, when not the first.
        fixed_address: Option<String>,
    },
}

impl ResourceAction {
    /// Short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::AddRouterInterface { .. } => "add router interface",
            Self::RemoveRouterInterface { .. } => "remove router interface",
            Self::AddFloatingIp { .. } => "add floating ip",
        }
    }
}

/// Errors surfaced by providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// The resource does not exist (or no longer exists).
    #[error("{kind} `{id}` was not found")]
    NotFound {
        /// Kind of the missing resource.
        kind: ResourceKind,
        /// Identifier that was requested.
        id: String,
    },
    /// The request conflicts with existing state, for example a duplicate.
    #[error("conflict: {message}")]
    Conflict {
        /// Provider message.
        message: String,
    },
    /// Any other non-success response.
    #[error("provider returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider message.
        message: String,
    },
    /// Authentication failed or the token was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The request could not be sent.
    #[error("request failed: {0}")]
    Http(String),
    /// The response could not be decoded.
    #[error("unexpected response: {0}")]
    Decode(String),
    /// The resource reached a terminal failure status while waiting.
    #[error("{kind} `{id}` entered status {status}")]
    Failed {
        /// Kind of the resource.
        kind: ResourceKind,
        /// Resource identifier.
        id: String,
        /// Status reported by the provider.
        status: String,
    },
    /// The provider offers no such action for the kind.
    #[error("{action} is not supported for {kind}")]
    Unsupported {
        /// Kind the action targeted.
        kind: ResourceKind,
        /// Action label.
        action: &'static str,
    },
    /// A bounded wait ran out of time.
    #[error("timed out after {waited:?} waiting for {kind} `{id}` to become {wanted}")]
    Timeout {
        /// Kind of the resource.
        kind: ResourceKind,
        /// Resource identifier.
        id: String,
        /// Status that was awaited.
        wanted: String,
        /// How long the wait lasted.
        waited: Duration,
    },
}

impl ProviderError {
    /// Returns `true` when the resource is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` when the provider rejected the request because of
    /// existing state.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` when the provider message contains `needle`, ignoring
    /// case.
    #[must_use]
    pub fn mentions(&self, needle: &str) -> bool {
        let message = match self {
            Self::Conflict { message } | Self::Api { message, .. } => message,
            _ => return false,
        };
        message.to_lowercase().contains(&needle.to_lowercase())
    }
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Resource operations a cloud provider must offer.
pub trait Provider: Send + Sync {
    /// Lists every resource of `kind` visible to the session.
    fn list(&self, kind: ResourceKind) -> ProviderFuture<'_, Vec<Resource>>;

    /// Fetches one resource by id.
    fn get<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ProviderFuture<'a, Resource>;

    /// Creates a resource and returns the provider's record of it.
    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        spec: &'a ResourceSpec,
    ) -> ProviderFuture<'a, Resource>;

    /// Deletes a resource by id.
    fn delete<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ProviderFuture<'a, ()>;

    /// Applies a kind-specific action to a resource.
    fn perform<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        action: &'a ResourceAction,
    ) -> ProviderFuture<'a, ()>;
}

#[cfg(test)]
mod tests;
