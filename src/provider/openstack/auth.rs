//! Keystone v2.0 token negotiation and service catalogue lookup.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::config::Credentials;
use crate::provider::ProviderError;

/// Services the provider talks to, keyed by catalogue type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Service {
    Network,
    Compute,
}

impl Service {
    pub(super) const fn catalog_type(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Compute => "compute",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct Token {
    id: String,
}

#[derive(Clone, Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, Deserialize)]
struct Endpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

/// Endpoints advertised by Keystone for the authenticated project.
#[derive(Clone, Debug)]
pub struct ServiceCatalog {
    entries: Vec<CatalogEntry>,
}

impl ServiceCatalog {
    /// Parses the `serviceCatalog` array of a Keystone v2.0 token response.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Decode`] when the value is not a catalogue.
    pub fn from_value(value: Value) -> Result<Self, ProviderError> {
        let entries = serde_json::from_value(value)
            .map_err(|err| ProviderError::Decode(format!("service catalog: {err}")))?;
        Ok(Self { entries })
    }

    /// Public URL of `service_type`, preferring an endpoint in `region`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Auth`] when the catalogue has no matching
    /// endpoint.
    pub fn endpoint(&self, service_type: &str, region: Option<&str>) -> Result<String, ProviderError> {
        let mut endpoints = self
            .entries
            .iter()
            .filter(|entry| entry.service_type == service_type)
            .flat_map(|entry| entry.endpoints.iter());
        let chosen = match region {
            Some(wanted) => endpoints.find(|endpoint| endpoint.region.as_deref() == Some(wanted)),
            None => endpoints.next(),
        };
        chosen
            .map(|endpoint| endpoint.public_url.trim_end_matches('/').to_owned())
            .ok_or_else(|| match region {
                Some(wanted) => {
                    ProviderError::Auth(format!("no {service_type} endpoint in region {wanted}"))
                }
                None => ProviderError::Auth(format!("no {service_type} endpoint in catalog")),
            })
    }
}

/// Authenticated session: token plus resolved endpoints.
#[derive(Clone, Debug)]
pub(super) struct Session {
    pub(super) token: String,
    network: String,
    compute: String,
}

impl Session {
    pub(super) fn endpoint(&self, service: Service) -> &str {
        match service {
            Service::Network => &self.network,
            Service::Compute => &self.compute,
        }
    }
}

pub(super) fn token_request(credentials: &Credentials) -> Value {
    let mut password = Map::new();
    if let Some(username) = &credentials.username {
        password.insert(String::from("username"), json!(username));
    } else if let Some(user_id) = &credentials.user_id {
        password.insert(String::from("userId"), json!(user_id));
    }
    password.insert(String::from("password"), json!(credentials.password));

    let mut auth = Map::new();
    auth.insert(String::from("passwordCredentials"), Value::Object(password));
    if let Some(project_name) = &credentials.project_name {
        auth.insert(String::from("tenantName"), json!(project_name));
    } else if let Some(project_id) = &credentials.project_id {
        auth.insert(String::from("tenantId"), json!(project_id));
    }
    json!({ "auth": auth })
}

pub(super) async fn authenticate(
    client: &reqwest::Client,
    credentials: &Credentials,
) -> Result<Session, ProviderError> {
    let url = format!("{}/tokens", credentials.auth_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(&token_request(credentials))
        .send()
        .await
        .map_err(|err| ProviderError::Http(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Auth(format!("keystone returned {status}: {body}")));
    }
    let token: TokenResponse = response
        .json()
        .await
        .map_err(|err| ProviderError::Decode(format!("token response: {err}")))?;
    let catalog = ServiceCatalog {
        entries: token.access.service_catalog,
    };
    let region = credentials.region_name.as_deref();
    Ok(Session {
        token: token.access.token.id,
        network: catalog.endpoint(Service::Network.catalog_type(), region)?,
        compute: catalog.endpoint(Service::Compute.catalog_type(), region)?,
    })
}
