//! Concrete OpenStack tasks and the static registry.
//!
//! Each task reconciles one resource kind for the selected environment.
//! Listings and plans are published in the run store under the task's
//! identity so that later tasks can resolve names to provider identifiers.

use tracing::info;

use crate::provider::{Provider, Resource, ResourceKind, ResourceSpec};
use crate::reconcile::{self, Reconciliation};
use crate::store::Store;
use crate::task::{Task, TaskDescriptor, TaskError};

pub mod beachhead;
pub mod instance;
pub mod keypair;
pub mod network;
pub mod router;
pub mod router_interface;
pub mod security_group;
pub mod subnet;

pub use beachhead::BeachheadTask;
pub use instance::InstanceTask;
pub use keypair::KeypairTask;
pub use network::NetworkTask;
pub use router::RouterTask;
pub use router_interface::RouterInterfaceTask;
pub use security_group::SecurityGroupTask;
pub use subnet::SubnetTask;

/// Identity of [`RouterTask`].
pub const ROUTER: &str = "router";
/// Identity of [`NetworkTask`].
pub const NETWORK: &str = "network";
/// Identity of [`SubnetTask`].
pub const SUBNET: &str = "subnet";
/// Identity of [`RouterInterfaceTask`].
pub const ROUTER_INTERFACE: &str = "router_interface";
/// Identity of [`SecurityGroupTask`].
pub const SECURITY_GROUP: &str = "security_group";
/// Identity of [`KeypairTask`].
pub const KEYPAIR: &str = "keypair";
/// Identity of [`BeachheadTask`].
pub const BEACHHEAD: &str = "beachhead";
/// Identity of [`InstanceTask`].
pub const INSTANCE: &str = "instance";

fn boxed<T>(task: T) -> Box<dyn Task>
where
    T: Task + 'static,
{
    Box::new(task)
}

/// Every task the orchestrator knows, with its dependency metadata.
#[must_use]
pub fn registry() -> Vec<TaskDescriptor> {
    vec![
        TaskDescriptor::new(ROUTER, |context, _| RouterTask::new(context).map(boxed)),
        TaskDescriptor::new(NETWORK, |context, _| NetworkTask::new(context).map(boxed))
            .depends([ROUTER]),
        TaskDescriptor::new(SUBNET, |context, _| SubnetTask::new(context).map(boxed))
            .depends([NETWORK]),
        TaskDescriptor::new(ROUTER_INTERFACE, |context, _| {
            RouterInterfaceTask::new(context).map(boxed)
        })
        .depends([ROUTER, SUBNET]),
        TaskDescriptor::new(SECURITY_GROUP, |context, _| {
            SecurityGroupTask::new(context).map(boxed)
        }),
        TaskDescriptor::new(KEYPAIR, |context, _| KeypairTask::new(context).map(boxed)),
        TaskDescriptor::new(BEACHHEAD, |context, _| BeachheadTask::new(context).map(boxed))
            .depends([ROUTER_INTERFACE, NETWORK, SUBNET, SECURITY_GROUP]),
        TaskDescriptor::new(INSTANCE, |context, _| InstanceTask::new(context).map(boxed))
            .depends([
                ROUTER_INTERFACE,
                NETWORK,
                SUBNET,
                SECURITY_GROUP,
                KEYPAIR,
                BEACHHEAD,
            ]),
    ]
}

/// Lists `kind`, diffs it against `expected` and publishes both the
/// listing and the plan under `task`.
async fn survey<I>(
    provider: &dyn Provider,
    store: &mut Store,
    task: &str,
    kind: ResourceKind,
    expected: I,
) -> Result<Reconciliation, TaskError>
where
    I: IntoIterator<Item = String>,
{
    let existing = provider.list(kind).await?;
    let plan = Reconciliation::compute(
        expected,
        existing.iter().map(|resource| resource.name.clone()),
    );
    plan.log(kind);
    reconcile::publish(store, task, existing);
    reconcile::publish_plan(store, task, &plan);
    Ok(plan)
}

/// Creates `spec` and appends the result to `task`'s listing.
async fn create_recorded(
    provider: &dyn Provider,
    store: &mut Store,
    task: &str,
    kind: ResourceKind,
    spec: &ResourceSpec,
) -> Result<Resource, TaskError> {
    info!(%kind, name = %spec.name, "creating {kind} {}", spec.name);
    let created = provider.create(kind, spec).await?;
    info!(%kind, name = %spec.name, id = %created.id, "{kind} {} created", spec.name);
    reconcile::record_created(store, task, created.clone())?;
    Ok(created)
}

/// Deletes every listed resource whose name is in `names`, skipping those
/// `protected` matches. Resources that vanished meanwhile are ignored.
async fn destroy_surplus<'n, N, P>(
    provider: &dyn Provider,
    store: &mut Store,
    task: &str,
    kind: ResourceKind,
    names: N,
    protected: P,
) -> Result<(), TaskError>
where
    N: IntoIterator<Item = &'n String>,
    P: Fn(&Resource) -> bool,
{
    for name in names {
        let targets: Vec<Resource> = store
            .get::<Vec<Resource>>(&reconcile::existing_key(task))?
            .iter()
            .filter(|resource| &resource.name == name)
            .cloned()
            .collect();
        for resource in targets {
            if protected(&resource) {
                info!(%kind, %name, "skipping destroy of protected {kind} {name}");
                continue;
            }
            info!(%kind, %name, id = %resource.id, "destroying {kind} {name}");
            reconcile::tolerate_absent(provider.delete(kind, &resource.id).await, kind, name)?;
            reconcile::record_destroyed(store, task, &resource.id)?;
        }
    }
    Ok(())
}

/// Resolves an image or flavor given by name or identifier.
async fn resolve_catalog(
    provider: &dyn Provider,
    kind: ResourceKind,
    reference: &str,
) -> Result<String, TaskError> {
    provider
        .list(kind)
        .await?
        .into_iter()
        .find(|resource| resource.name == reference || resource.id == reference)
        .map(|resource| resource.id)
        .ok_or_else(|| TaskError::not_found(kind, reference))
}

#[cfg(test)]
mod tests;
