//! Compute instances declared by roles.
//!
//! Construction expands every role's slots for the environment into named
//! instances. Only servers carrying this environment's name prefix are
//! reconciled, so the beachhead and servers of other environments are left
//! alone. Commission runs each role's provisioner on the instances created
//! in this run, over SSH tunnelled through the beachhead.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::{Value, json};
use shell_escape::unix::escape;
use tracing::{info, warn};

use crate::config::{NicSpec, Settings};
use crate::provider::{Provider, Resource, ResourceAction, ResourceKind, ResourceSpec};
use crate::reconcile::{self, Reconciliation};
use crate::store::{Store, StoreError};
use crate::task::{Task, TaskContext, TaskError, TaskFuture};
use crate::transport::ssh::DEFAULT_SSO_USER;
use crate::transport::{Connection, Connector, SshTarget};

use super::beachhead::{connection_key, key_file_key, keypair_key};
use super::{INSTANCE, NETWORK, create_recorded, destroy_surplus, resolve_catalog, survey};

const SSH_PORT: u16 = 22;

/// One instance expanded from a role slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedInstance {
    /// Generated instance name.
    pub name: String,
    /// Role the instance belongs to.
    pub role: String,
    /// Environment being reconciled.
    pub environment: String,
    /// Image name or id.
    pub image: String,
    /// Flavor name or id.
    pub flavor: String,
    /// Availability zone.
    pub az: String,
    /// Keypair injected at boot; the beachhead keypair when absent.
    pub keypair: Option<String>,
    /// Security groups; `default` plus the role name when the role lists
    /// none.
    pub security_groups: Vec<String>,
    /// Network attachments.
    pub nics: Vec<NicSpec>,
    /// Login user for provisioning.
    pub user: String,
    /// Provisioner argv, if the role has one.
    pub provisioner: Option<Vec<String>>,
}

impl PlannedInstance {
    /// Provisioner rendered as a shell command line with placeholders
    /// substituted and every word escaped.
    #[must_use]
    pub fn provisioner_command(&self) -> Option<String> {
        let argv = self.provisioner.as_ref()?;
        let words: Vec<String> = argv
            .iter()
            .map(|word| {
                let rendered = word
                    .replace("{name}", &self.name)
                    .replace("{role}", &self.role)
                    .replace("{environment}", &self.environment);
                escape(Cow::Owned(rendered)).into_owned()
            })
            .collect();
        Some(words.join(" "))
    }
}

/// Expands `role` slots for `environment` into named instances, skipping
/// roles without an image or flavor.
#[must_use]
pub fn expand_roles(context: &TaskContext) -> BTreeMap<String, PlannedInstance> {
    let document = context.document();
    let environment = context.environment();
    let mut instances = BTreeMap::new();
    for (role_name, role) in &document.roles {
        let Some(slots) = role.instances.get(environment) else {
            continue;
        };
        let (Some(image), Some(flavor)) = (&role.image, &role.flavor) else {
            warn!(role = %role_name, "skipping role {role_name}: no image and/or flavor");
            continue;
        };
        let security_groups = if role.security_groups.is_empty() {
            vec![String::from("default"), role_name.clone()]
        } else {
            role.security_groups.clone()
        };
        for slot in slots {
            let name = document.instance_name(environment, &slot.az, role_name, slot.number);
            instances.insert(
                name.clone(),
                PlannedInstance {
                    name,
                    role: role_name.clone(),
                    environment: environment.to_owned(),
                    image: image.clone(),
                    flavor: flavor.clone(),
                    az: slot.az.clone(),
                    keypair: role.keypair.clone(),
                    security_groups: security_groups.clone(),
                    nics: slot.nics.clone(),
                    user: role.user.clone().unwrap_or_else(|| DEFAULT_SSO_USER.to_owned()),
                    provisioner: role.provisioner.clone(),
                },
            );
        }
    }
    instances
}

/// Reconciles role instances and provisions new ones.
pub struct InstanceTask {
    provider: Arc<dyn Provider>,
    connector: Arc<dyn Connector>,
    settings: Arc<Settings>,
    managed_prefix: String,
    instances: BTreeMap<String, PlannedInstance>,
    plan: Reconciliation,
    created: Vec<Resource>,
}

impl InstanceTask {
    /// Expands the roles for the selected environment.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the environment is undefined.
    pub fn new(context: &TaskContext) -> Result<Self, TaskError> {
        context.environment_config()?;
        Ok(Self {
            provider: Arc::clone(context.provider()),
            connector: Arc::clone(context.connector()),
            settings: Arc::clone(context.settings()),
            managed_prefix: format!(
                "{}{}",
                context.document().instance_name_prefix,
                context.environment()
            ),
            instances: expand_roles(context),
            plan: Reconciliation::default(),
            created: Vec::new(),
        })
    }

    /// Instances this task expects to exist.
    #[must_use]
    pub const fn instances(&self) -> &BTreeMap<String, PlannedInstance> {
        &self.instances
    }

    fn request(
        &self,
        instance: &PlannedInstance,
        store: &Store,
        image: String,
        flavor: String,
    ) -> Result<ResourceSpec, TaskError> {
        let networks = instance
            .nics
            .iter()
            .map(|nic| -> Result<Value, TaskError> {
                let id = reconcile::resolve_id(store, NETWORK, ResourceKind::Network, &nic.network)?;
                Ok(match &nic.fixed_ip {
                    Some(address) => json!({ "uuid": id, "fixed_ip": address }),
                    None => json!({ "uuid": id }),
                })
            })
            .collect::<Result<Vec<Value>, TaskError>>()?;
        let keypair = match &instance.keypair {
            Some(keypair) => Some(keypair.clone()),
            None => optional(store.get::<Resource>(&keypair_key()))?.map(|keypair| keypair.name.clone()),
        };
        let groups: Vec<Value> = instance
            .security_groups
            .iter()
            .map(|group| json!({ "name": group }))
            .collect();
        Ok(ResourceSpec::new(instance.name.as_str())
            .with("imageRef", image)
            .with("flavorRef", flavor)
            .with("availability_zone", instance.az.as_str())
            .with("networks", networks)
            .with("security_groups", groups)
            .with_optional("key_name", keypair)
            .with(
                "metadata",
                json!({ "environment": instance.environment, "role": instance.role }),
            ))
    }

    async fn create_all(&mut self, store: &mut Store) -> Result<(), TaskError> {
        info!("building {} instances", self.plan.to_create.len());
        let provider = Arc::clone(&self.provider);
        for name in self.plan.to_create.clone() {
            let Some(instance) = self.instances.get(&name) else {
                continue;
            };
            let image = resolve_catalog(provider.as_ref(), ResourceKind::Image, &instance.image).await?;
            let flavor =
                resolve_catalog(provider.as_ref(), ResourceKind::Flavor, &instance.flavor).await?;
            let spec = self.request(instance, store, image, flavor)?;
            let created =
                create_recorded(provider.as_ref(), store, INSTANCE, ResourceKind::Server, &spec).await?;
            self.created.push(created);
        }

        info!("blocking for {} instances to become ACTIVE", self.created.len());
        let policy = self.settings.retry_policy();
        for server in &mut self.created {
            *server = policy
                .wait_for_status(provider.as_ref(), ResourceKind::Server, &server.id, "ACTIVE")
                .await?;
            let Some(instance) = self.instances.get(&server.name) else {
                continue;
            };
            for nic in &instance.nics {
                let Some(address) = &nic.floating_ip else {
                    continue;
                };
                info!(instance = %server.name, %address, "attaching floating ip {address}");
                let action = ResourceAction::AddFloatingIp {
                    address: address.clone(),
                    fixed_address: nic.fixed_ip.clone(),
                };
                provider.perform(ResourceKind::Server, &server.id, &action).await?;
            }
        }
        info!("all newly created instances ACTIVE");
        Ok(())
    }

    async fn provision_all(&self, store: &Store) -> Result<(), TaskError> {
        let pending: Vec<(&Resource, &PlannedInstance, String)> = self
            .created
            .iter()
            .filter_map(|server| {
                let instance = self.instances.get(&server.name)?;
                Some((server, instance, instance.provisioner_command()?))
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let Some(connection) = optional(store.get::<Arc<Connection>>(&connection_key()))? else {
            warn!("no beachhead connection; skipping provisioning");
            return Ok(());
        };
        let identity = optional(store.get::<Utf8PathBuf>(&key_file_key()))?.cloned();

        for (server, instance, command) in pending {
            let address = private_address(server, instance)
                .ok_or_else(|| TaskError::not_found("address of instance", server.name.as_str()))?;
            let local_port = connection.tunnel(&address, SSH_PORT).await?;
            let outcome = self
                .provision(instance, &command, local_port, identity.clone())
                .await;
            connection.stop_tunnel(local_port).await;
            outcome?;
        }
        Ok(())
    }

    async fn provision(
        &self,
        instance: &PlannedInstance,
        command: &str,
        local_port: u16,
        identity: Option<Utf8PathBuf>,
    ) -> Result<(), TaskError> {
        let bind = self.settings.tunnel_bind()?.ip();
        let host = if bind.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            bind
        };
        let mut target = SshTarget::new(host.to_string(), instance.user.as_str()).with_port(local_port);
        if let Some(identity) = identity {
            target = target.with_identity(identity);
        }

        info!(instance = %instance.name, "provisioning instance {}", instance.name);
        let transport = self.connector.connect(&target).await?;
        let executed = transport.execute(command).await;
        transport.close().await?;
        let output = executed?;
        if !output.is_success() {
            return Err(TaskError::Provisioner {
                instance: instance.name.clone(),
                code: output.code,
                stderr: output.stderr,
            });
        }
        info!(instance = %instance.name, "instance {} provisioned", instance.name);
        Ok(())
    }
}

fn optional<T>(value: Result<T, StoreError>) -> Result<Option<T>, TaskError> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::Missing { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Address the beachhead uses to reach `server`: a configured fixed IP,
/// otherwise the first address the provider reports.
fn private_address(server: &Resource, instance: &PlannedInstance) -> Option<String> {
    instance
        .nics
        .iter()
        .find_map(|nic| nic.fixed_ip.clone())
        .or_else(|| {
            server
                .attributes
                .get("addresses")?
                .as_object()?
                .values()
                .filter_map(Value::as_array)
                .flatten()
                .find_map(|address| address.get("addr")?.as_str().map(str::to_owned))
        })
}

impl Task for InstanceTask {
    fn introspect<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            self.plan = survey(
                self.provider.as_ref(),
                store,
                INSTANCE,
                ResourceKind::Server,
                self.instances.keys().cloned(),
            )
            .await?;
            Ok(())
        })
    }

    fn build<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(self.create_all(store))
    }

    fn commission<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move { self.provision_all(store).await })
    }

    fn destroy<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        info!("destroying {} instances", self.plan.to_destroy.len());
        Box::pin(destroy_surplus(
            self.provider.as_ref(),
            store,
            INSTANCE,
            ResourceKind::Server,
            &self.plan.to_destroy,
            |server| !server.name.starts_with(&self.managed_prefix),
        ))
    }
}

#[cfg(test)]
mod tests;
