//! Keypair reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::info;

use crate::config::KeypairSpec;
use crate::provider::{Provider, ResourceKind, ResourceSpec};
use crate::reconcile::Reconciliation;
use crate::store::Store;
use crate::task::{Task, TaskContext, TaskError, TaskFuture};
use crate::transport::ssh::write_private_key;

use super::{KEYPAIR, create_recorded, destroy_surplus, survey};

/// Imports configured public keys, or has the provider generate a pair and
/// saves the private half under the key directory.
pub struct KeypairTask {
    provider: Arc<dyn Provider>,
    keypairs: BTreeMap<String, KeypairSpec>,
    key_dir: Utf8PathBuf,
    plan: Reconciliation,
}

impl KeypairTask {
    /// Reads the environment's keypairs.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the environment is undefined.
    pub fn new(context: &TaskContext) -> Result<Self, TaskError> {
        Ok(Self {
            provider: Arc::clone(context.provider()),
            keypairs: context.environment_config()?.keypairs.clone(),
            key_dir: context.settings().key_dir(),
            plan: Reconciliation::default(),
        })
    }
}

impl Task for KeypairTask {
    fn introspect<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            let expected = self.keypairs.keys().cloned();
            self.plan =
                survey(self.provider.as_ref(), store, KEYPAIR, ResourceKind::Keypair, expected)
                    .await?;
            Ok(())
        })
    }

    fn build<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            for name in &self.plan.to_create {
                let public_key = self
                    .keypairs
                    .get(name)
                    .and_then(|keypair| keypair.public_key.clone());
                let spec = ResourceSpec::new(name.as_str()).with_optional("public_key", public_key);
                let created =
                    create_recorded(self.provider.as_ref(), store, KEYPAIR, ResourceKind::Keypair, &spec)
                        .await?;
                if let Some(private_key) = created.attribute_str("private_key") {
                    let path = write_private_key(&self.key_dir, name, private_key)?;
                    info!(keypair = %name, %path, "generated private key saved");
                }
            }
            Ok(())
        })
    }

    fn destroy<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(destroy_surplus(
            self.provider.as_ref(),
            store,
            KEYPAIR,
            ResourceKind::Keypair,
            &self.plan.to_destroy,
            |_| false,
        ))
    }
}
