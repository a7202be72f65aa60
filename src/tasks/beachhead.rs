//! Beachhead host: a short-lived server with a floating IP that gives the
//! run an SSH path into the private networks.
//!
//! Build creates an ephemeral keypair (private key written to the key
//! directory), boots the server on every configured network, allocates a
//! floating IP, waits for the server to turn `ACTIVE`, associates the IP and
//! connects. The resulting [`Connection`] is published under
//! [`connection_key`] for the instance task to tunnel through. Destroy
//! disconnects and removes everything build created.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::info;
use uuid::Uuid;

use crate::config::{BeachheadSpec, Settings};
use crate::provider::{Provider, Resource, ResourceAction, ResourceKind, ResourceSpec};
use crate::reconcile;
use crate::store::{self, Store};
use crate::task::{Task, TaskContext, TaskError, TaskFuture};
use crate::transport::ssh::{remove_private_key, write_private_key};
use crate::transport::{Connection, Connector, SshTarget};

use super::{BEACHHEAD, NETWORK, resolve_catalog};

/// Store key of the beachhead [`Connection`] (`Arc<Connection>`).
#[must_use]
pub fn connection_key() -> String {
    store::key(BEACHHEAD, "connection")
}

/// Store key of the beachhead keypair ([`Resource`]).
#[must_use]
pub fn keypair_key() -> String {
    store::key(BEACHHEAD, "keypair")
}

/// Store key of the beachhead private key path ([`Utf8PathBuf`]).
#[must_use]
pub fn key_file_key() -> String {
    store::key(BEACHHEAD, "key_file")
}

fn server_key() -> String {
    store::key(BEACHHEAD, "server")
}

fn floating_ip_key() -> String {
    store::key(BEACHHEAD, "floating_ip")
}

/// Bootstrap host task; disabled unless the environment configures one.
pub struct BeachheadTask {
    provider: Arc<dyn Provider>,
    connector: Arc<dyn Connector>,
    settings: Arc<Settings>,
    spec: Option<BeachheadSpec>,
    networks: Vec<String>,
}

impl BeachheadTask {
    /// Reads the beachhead section and the environment's network names.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the environment is undefined.
    pub fn new(context: &TaskContext) -> Result<Self, TaskError> {
        let environment = context.environment_config()?;
        Ok(Self {
            provider: Arc::clone(context.provider()),
            connector: Arc::clone(context.connector()),
            settings: Arc::clone(context.settings()),
            spec: environment.beachhead.clone(),
            networks: environment.networks.keys().cloned().collect(),
        })
    }

    async fn launch(&self, spec: &BeachheadSpec, store: &mut Store) -> Result<(), TaskError> {
        let provider = self.provider.as_ref();
        let name = format!("beachhead-{}", Uuid::new_v4().simple());

        info!(beachhead = %name, "creating keypair {name}");
        let keypair = provider
            .create(ResourceKind::Keypair, &ResourceSpec::new(name.as_str()))
            .await?;
        store.insert(keypair_key(), keypair.clone());
        let private_key = keypair
            .attribute_str("private_key")
            .ok_or_else(|| TaskError::not_found("private key", name.as_str()))?;
        let key_file = write_private_key(&self.settings.key_dir(), &name, private_key)?;
        store.insert(key_file_key(), key_file.clone());

        let networks = self
            .networks
            .iter()
            .map(|network| {
                reconcile::resolve_id(store, NETWORK, ResourceKind::Network, network)
                    .map(|id| json!({ "uuid": id }))
            })
            .collect::<Result<Vec<Value>, TaskError>>()?;
        let groups: Vec<Value> = spec
            .security_groups
            .iter()
            .map(|group| json!({ "name": group }))
            .collect();
        let request = ResourceSpec::new(name.as_str())
            .with("imageRef", resolve_catalog(provider, ResourceKind::Image, &spec.image).await?)
            .with("flavorRef", resolve_catalog(provider, ResourceKind::Flavor, &spec.flavor).await?)
            .with("networks", networks)
            .with("security_groups", groups)
            .with("key_name", name.as_str());

        info!(beachhead = %name, "creating beachhead instance {name}");
        let server = provider.create(ResourceKind::Server, &request).await?;
        store.insert(server_key(), server.clone());

        info!(pool = %spec.floating_ip_pool, "allocating floating IP for beachhead instance");
        let pool_request = ResourceSpec::new(spec.floating_ip_pool.as_str())
            .with("pool", spec.floating_ip_pool.as_str());
        let floating_ip = provider.create(ResourceKind::FloatingIp, &pool_request).await?;
        store.insert(floating_ip_key(), floating_ip.clone());
        info!(address = %floating_ip.name, "floating IP {} allocated", floating_ip.name);

        self.settings
            .retry_policy()
            .wait_for_status(provider, ResourceKind::Server, &server.id, "ACTIVE")
            .await?;
        let attach = ResourceAction::AddFloatingIp {
            address: floating_ip.name.clone(),
            fixed_address: None,
        };
        provider.perform(ResourceKind::Server, &server.id, &attach).await?;
        sleep(self.settings.floating_ip_settle()).await;

        info!(address = %floating_ip.name, "connecting to the beachhead instance");
        let target = SshTarget::new(floating_ip.name.as_str(), spec.user.as_str()).with_identity(key_file);
        let transport = self.connector.connect(&target).await?;
        let connection = Connection::new(transport)
            .with_bind_address(self.settings.tunnel_bind()?)
            .with_drain_timeout(self.settings.tunnel_drain_timeout());
        store.insert(connection_key(), Arc::new(connection));
        Ok(())
    }

    async fn teardown(&self, store: &mut Store) -> Result<(), TaskError> {
        let provider = self.provider.as_ref();

        info!("disconnecting from beachhead instance");
        let connection = Arc::clone(store.get::<Arc<Connection>>(&connection_key())?);
        connection.disconnect().await?;

        info!("destroying beachhead instance, keypair and floating IP");
        let server = store.remove::<Resource>(&server_key())?;
        reconcile::tolerate_absent(
            provider.delete(ResourceKind::Server, &server.id).await,
            ResourceKind::Server,
            &server.name,
        )?;
        let floating_ip = store.remove::<Resource>(&floating_ip_key())?;
        reconcile::tolerate_absent(
            provider.delete(ResourceKind::FloatingIp, &floating_ip.id).await,
            ResourceKind::FloatingIp,
            &floating_ip.name,
        )?;
        let keypair = store.remove::<Resource>(&keypair_key())?;
        reconcile::tolerate_absent(
            provider.delete(ResourceKind::Keypair, &keypair.id).await,
            ResourceKind::Keypair,
            &keypair.name,
        )?;
        let key_file = store.remove::<Utf8PathBuf>(&key_file_key())?;
        remove_private_key(&key_file)?;
        Ok(())
    }
}

impl Task for BeachheadTask {
    fn enabled(&self) -> bool {
        self.spec.is_some()
    }

    fn build<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            match self.spec.clone() {
                Some(spec) => self.launch(&spec, store).await,
                None => Ok(()),
            }
        })
    }

    fn destroy<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            if self.spec.is_none() {
                return Ok(());
            }
            self.teardown(store).await
        })
    }
}
