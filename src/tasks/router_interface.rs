//! Router interface attachment.
//!
//! Commission attaches each router's configured subnets; a subnet that is
//! already attached is fine. Decommission detaches subnets from routers
//! that are about to be destroyed, and detaches subnets that are about to
//! be destroyed from every router, so the destroy phase finds them free.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::RouterSpec;
use crate::provider::{Provider, Resource, ResourceAction, ResourceKind};
use crate::reconcile;
use crate::store::Store;
use crate::task::{Task, TaskContext, TaskError, TaskFuture};

use super::{ROUTER, SUBNET};

const ALREADY_ATTACHED: &str = "already has a port";

/// Attaches and detaches router interfaces.
pub struct RouterInterfaceTask {
    provider: Arc<dyn Provider>,
    routers: BTreeMap<String, RouterSpec>,
}

impl RouterInterfaceTask {
    /// Reads the environment's router interface lists.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the environment is undefined.
    pub fn new(context: &TaskContext) -> Result<Self, TaskError> {
        Ok(Self {
            provider: Arc::clone(context.provider()),
            routers: context.environment_config()?.routers.clone(),
        })
    }

    fn attachments(&self, store: &Store) -> Result<Vec<Attachment>, TaskError> {
        let mut attachments = Vec::new();
        for (router, spec) in &self.routers {
            for subnet in &spec.interfaces {
                attachments.push(Attachment {
                    router: router.clone(),
                    router_id: reconcile::resolve_id(store, ROUTER, ResourceKind::Router, router)?,
                    subnet: subnet.clone(),
                    subnet_id: reconcile::resolve_id(store, SUBNET, ResourceKind::Subnet, subnet)?,
                });
            }
        }
        Ok(attachments)
    }

    fn detachments(store: &Store) -> Result<BTreeSet<Attachment>, TaskError> {
        let routers = listing(store, ROUTER)?;
        let subnets = listing(store, SUBNET)?;
        let doomed_routers = &reconcile::plan(store, ROUTER)?.to_destroy;
        let doomed_subnets = &reconcile::plan(store, SUBNET)?.to_destroy;

        let mut detachments = BTreeSet::new();
        for router in routers {
            for subnet in subnets {
                if doomed_routers.contains(&router.name) || doomed_subnets.contains(&subnet.name) {
                    detachments.insert(Attachment::between(router, subnet));
                }
            }
        }
        Ok(detachments)
    }
}

fn listing<'s>(store: &'s Store, task: &str) -> Result<&'s Vec<Resource>, TaskError> {
    Ok(store.get::<Vec<Resource>>(&reconcile::existing_key(task))?)
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Attachment {
    router_id: String,
    subnet_id: String,
    router: String,
    subnet: String,
}

impl Attachment {
    fn between(router: &Resource, subnet: &Resource) -> Self {
        Self {
            router_id: router.id.clone(),
            subnet_id: subnet.id.clone(),
            router: router.name.clone(),
            subnet: subnet.name.clone(),
        }
    }
}

impl Task for RouterInterfaceTask {
    fn commission<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            for attachment in self.attachments(store)? {
                let action = ResourceAction::AddRouterInterface {
                    subnet_id: attachment.subnet_id.clone(),
                };
                match self
                    .provider
                    .perform(ResourceKind::Router, &attachment.router_id, &action)
                    .await
                {
                    Ok(()) => info!(
                        router = %attachment.router,
                        subnet = %attachment.subnet,
                        "attached subnet {} to router {}",
                        attachment.subnet,
                        attachment.router
                    ),
                    Err(err) if err.mentions(ALREADY_ATTACHED) => debug!(
                        router = %attachment.router,
                        subnet = %attachment.subnet,
                        "subnet already attached"
                    ),
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(())
        })
    }

    fn decommission<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            for detachment in Self::detachments(store)? {
                let action = ResourceAction::RemoveRouterInterface {
                    subnet_id: detachment.subnet_id.clone(),
                };
                let result = self
                    .provider
                    .perform(ResourceKind::Router, &detachment.router_id, &action)
                    .await;
                reconcile::tolerate_absent(result, ResourceKind::Subnet, &detachment.subnet)?;
                debug!(
                    router = %detachment.router,
                    subnet = %detachment.subnet,
                    "router interface detached"
                );
            }
            Ok(())
        })
    }
}
