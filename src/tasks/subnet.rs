//! Subnet reconciliation. Subnets are declared inside their networks and
//! flattened into one namespace.

use std::sync::Arc;

use serde_json::Value;

use crate::config::SubnetSpec;
use crate::provider::{Provider, ResourceKind, ResourceSpec};
use crate::reconcile::{self, Reconciliation};
use crate::store::Store;
use crate::task::{Task, TaskContext, TaskError, TaskFuture};

use super::network::EXTERNAL_NETWORK;
use super::{NETWORK, SUBNET, create_recorded, destroy_surplus, survey};

struct PlannedSubnet {
    name: String,
    network: String,
    spec: SubnetSpec,
}

/// Creates configured subnets on their networks and deletes the rest,
/// leaving subnets of the external network alone.
pub struct SubnetTask {
    provider: Arc<dyn Provider>,
    subnets: Vec<PlannedSubnet>,
    plan: Reconciliation,
}

impl SubnetTask {
    /// Flattens the environment's subnets.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the environment is undefined.
    pub fn new(context: &TaskContext) -> Result<Self, TaskError> {
        let subnets = context
            .environment_config()?
            .subnets()
            .map(|(network, name, spec)| PlannedSubnet {
                name: name.to_owned(),
                network: network.to_owned(),
                spec: spec.clone(),
            })
            .collect();
        Ok(Self {
            provider: Arc::clone(context.provider()),
            subnets,
            plan: Reconciliation::default(),
        })
    }

    fn request(subnet: &PlannedSubnet, network_id: String) -> ResourceSpec {
        let nameservers = (!subnet.spec.dns_nameservers.is_empty()).then(|| {
            Value::from(subnet.spec.dns_nameservers.clone())
        });
        ResourceSpec::new(subnet.name.as_str())
            .with("network_id", network_id)
            .with("cidr", subnet.spec.cidr.as_str())
            .with("ip_version", subnet.spec.ip_version)
            .with_optional("gateway_ip", subnet.spec.gateway_ip.clone())
            .with_optional("dns_nameservers", nameservers)
    }
}

impl Task for SubnetTask {
    fn introspect<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            let expected = self.subnets.iter().map(|subnet| subnet.name.clone());
            self.plan =
                survey(self.provider.as_ref(), store, SUBNET, ResourceKind::Subnet, expected)
                    .await?;
            Ok(())
        })
    }

    fn build<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            for subnet in &self.subnets {
                if !self.plan.to_create.contains(&subnet.name) {
                    continue;
                }
                let network_id =
                    reconcile::resolve_id(store, NETWORK, ResourceKind::Network, &subnet.network)?;
                let spec = Self::request(subnet, network_id);
                create_recorded(self.provider.as_ref(), store, SUBNET, ResourceKind::Subnet, &spec)
                    .await?;
            }
            Ok(())
        })
    }

    fn destroy<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            let external = reconcile::ids_named(store, NETWORK, EXTERNAL_NETWORK)?;
            destroy_surplus(
                self.provider.as_ref(),
                store,
                SUBNET,
                ResourceKind::Subnet,
                &self.plan.to_destroy,
                |subnet| {
                    subnet
                        .attribute_str("network_id")
                        .is_some_and(|id| external.iter().any(|external| external == id))
                },
            )
            .await
        })
    }
}
