//! OpenStack provider speaking Keystone v2.0, Neutron v2.0 and Nova v2.
//!
//! The client authenticates lazily on first use, caches the token together
//! with the endpoints resolved from the service catalogue, and re-negotiates
//! once when a request is rejected with `401`.

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Credentials;
use crate::provider::{
    Provider, ProviderError, ProviderFuture, Resource, ResourceAction, ResourceKind, ResourceSpec,
};

mod auth;
mod routes;

pub use auth::ServiceCatalog;

use auth::{Session, authenticate};
use routes::{classify, create_body, decode_list, decode_one, route};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// [`Provider`] backed by the OpenStack REST APIs.
#[derive(Debug)]
pub struct OpenStackProvider {
    client: Client,
    credentials: Credentials,
    session: Mutex<Option<Session>>,
}

impl OpenStackProvider {
    /// Creates a provider for the given credentials without contacting
    /// Keystone.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Http`] when the HTTP client cannot be built.
    pub fn new(credentials: Credentials) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::Http(err.to_string()))?;
        Ok(Self {
            client,
            credentials,
            session: Mutex::new(None),
        })
    }

    async fn session(&self) -> Result<Session, ProviderError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        debug!(auth_url = %self.credentials.auth_url, "authenticating with keystone");
        let session = authenticate(&self.client, &self.credentials).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate(&self) {
        self.session.lock().await.take();
    }

    async fn call(
        &self,
        kind: ResourceKind,
        id: Option<&str>,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ProviderError> {
        let mut reauthenticated = false;
        loop {
            let session = self.session().await?;
            let url = format!(
                "{}/{}",
                session.endpoint(route(kind).service).trim_end_matches('/'),
                path
            );
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("X-Auth-Token", &session.token)
                .header(ACCEPT, "application/json");
            if let Some(payload) = body {
                request = request.json(payload);
            }
            let response = request
                .send()
                .await
                .map_err(|err| ProviderError::Http(err.to_string()))?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                self.invalidate().await;
                reauthenticated = true;
                continue;
            }
            let text = response
                .text()
                .await
                .map_err(|err| ProviderError::Http(err.to_string()))?;
            if !status.is_success() {
                return Err(classify(status, &text, kind, id));
            }
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|err| ProviderError::Decode(err.to_string()));
        }
    }

    async fn list_resources(&self, kind: ResourceKind) -> Result<Vec<Resource>, ProviderError> {
        let body = self
            .call(kind, None, Method::GET, route(kind).list_path, None)
            .await?;
        decode_list(kind, body)
    }

    async fn get_resource(&self, kind: ResourceKind, id: &str) -> Result<Resource, ProviderError> {
        let path = format!("{}/{id}", route(kind).collection);
        let body = self.call(kind, Some(id), Method::GET, &path, None).await?;
        decode_one(kind, body, None)
    }

    async fn create_resource(
        &self,
        kind: ResourceKind,
        spec: &ResourceSpec,
    ) -> Result<Resource, ProviderError> {
        let payload = create_body(kind, spec);
        let body = self
            .call(kind, None, Method::POST, route(kind).collection, Some(&payload))
            .await?;
        decode_one(kind, body, Some(&spec.name))
    }

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> Result<(), ProviderError> {
        let path = format!("{}/{id}", route(kind).collection);
        self.call(kind, Some(id), Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    async fn perform_action(
        &self,
        kind: ResourceKind,
        id: &str,
        action: &ResourceAction,
    ) -> Result<(), ProviderError> {
        let collection = route(kind).collection;
        let (method, path, payload) = match (kind, action) {
            (ResourceKind::Router, ResourceAction::AddRouterInterface { subnet_id }) => (
                Method::PUT,
                format!("{collection}/{id}/add_router_interface"),
                json!({ "subnet_id": subnet_id }),
            ),
            (ResourceKind::Router, ResourceAction::RemoveRouterInterface { subnet_id }) => (
                Method::PUT,
                format!("{collection}/{id}/remove_router_interface"),
                json!({ "subnet_id": subnet_id }),
            ),
            (
                ResourceKind::Server,
                ResourceAction::AddFloatingIp {
                    address,
                    fixed_address,
                },
            ) => {
                let mut inner = json!({ "address": address });
                if let (Some(fixed), Some(map)) = (fixed_address, inner.as_object_mut()) {
                    map.insert(String::from("fixed_address"), json!(fixed));
                }
                (
                    Method::POST,
                    format!("{collection}/{id}/action"),
                    json!({ "addFloatingIp": inner }),
                )
            }
            _ => {
                return Err(ProviderError::Unsupported {
                    kind,
                    action: action.label(),
                });
            }
        };
        self.call(kind, Some(id), method, &path, Some(&payload))
            .await
            .map(|_| ())
    }
}

impl Provider for OpenStackProvider {
    fn list(&self, kind: ResourceKind) -> ProviderFuture<'_, Vec<Resource>> {
        Box::pin(self.list_resources(kind))
    }

    fn get<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ProviderFuture<'a, Resource> {
        Box::pin(self.get_resource(kind, id))
    }

    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        spec: &'a ResourceSpec,
    ) -> ProviderFuture<'a, Resource> {
        Box::pin(self.create_resource(kind, spec))
    }

    fn delete<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.delete_resource(kind, id))
    }

    fn perform<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        action: &'a ResourceAction,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(self.perform_action(kind, id, action))
    }
}
