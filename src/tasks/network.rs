//! Network reconciliation.

use std::sync::Arc;

use crate::provider::{Provider, ResourceKind, ResourceSpec};
use crate::reconcile::Reconciliation;
use crate::store::Store;
use crate::task::{Task, TaskContext, TaskError, TaskFuture};

use super::{NETWORK, create_recorded, destroy_surplus, survey};

/// Provider-managed external network; never destroyed even though no
/// environment declares it.
pub const EXTERNAL_NETWORK: &str = "Ext-Net";

/// Creates configured networks and deletes unconfigured ones, except
/// [`EXTERNAL_NETWORK`].
pub struct NetworkTask {
    provider: Arc<dyn Provider>,
    networks: Vec<String>,
    plan: Reconciliation,
}

impl NetworkTask {
    /// Reads the environment's network names.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the environment is undefined.
    pub fn new(context: &TaskContext) -> Result<Self, TaskError> {
        Ok(Self {
            provider: Arc::clone(context.provider()),
            networks: context.environment_config()?.networks.keys().cloned().collect(),
            plan: Reconciliation::default(),
        })
    }
}

impl Task for NetworkTask {
    fn introspect<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            let expected = self.networks.iter().cloned();
            self.plan =
                survey(self.provider.as_ref(), store, NETWORK, ResourceKind::Network, expected)
                    .await?;
            Ok(())
        })
    }

    fn build<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            for name in &self.plan.to_create {
                let spec = ResourceSpec::new(name.as_str());
                create_recorded(self.provider.as_ref(), store, NETWORK, ResourceKind::Network, &spec)
                    .await?;
            }
            Ok(())
        })
    }

    fn destroy<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(destroy_surplus(
            self.provider.as_ref(),
            store,
            NETWORK,
            ResourceKind::Network,
            &self.plan.to_destroy,
            |network| network.name == EXTERNAL_NETWORK,
        ))
    }
}
