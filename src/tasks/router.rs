//! Router reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RouterSpec;
use crate::provider::{Provider, ResourceKind, ResourceSpec};
use crate::reconcile::Reconciliation;
use crate::store::Store;
use crate::task::{Task, TaskContext, TaskError, TaskFuture};

use super::{ROUTER, create_recorded, destroy_surplus, survey};

/// Creates configured routers with their gateway and deletes the rest.
pub struct RouterTask {
    provider: Arc<dyn Provider>,
    routers: BTreeMap<String, RouterSpec>,
    plan: Reconciliation,
}

impl RouterTask {
    /// Reads the environment's routers.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the environment is undefined.
    pub fn new(context: &TaskContext) -> Result<Self, TaskError> {
        Ok(Self {
            provider: Arc::clone(context.provider()),
            routers: context.environment_config()?.routers.clone(),
            plan: Reconciliation::default(),
        })
    }
}

impl Task for RouterTask {
    fn introspect<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            let expected = self.routers.keys().cloned();
            self.plan =
                survey(self.provider.as_ref(), store, ROUTER, ResourceKind::Router, expected)
                    .await?;
            Ok(())
        })
    }

    fn build<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            for name in &self.plan.to_create {
                let gateway = self
                    .routers
                    .get(name)
                    .and_then(|router| router.external_gateway_info.clone());
                let spec = ResourceSpec::new(name.as_str())
                    .with_optional("external_gateway_info", gateway);
                create_recorded(
                    self.provider.as_ref(),
                    store,
                    ROUTER,
                    ResourceKind::Router,
                    &spec,
                )
                .await?;
            }
            Ok(())
        })
    }

    fn destroy<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(destroy_surplus(
            self.provider.as_ref(),
            store,
            ROUTER,
            ResourceKind::Router,
            &self.plan.to_destroy,
            |_| false,
        ))
    }
}
