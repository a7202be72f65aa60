//! Security group reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{RuleSpec, SecurityGroupSpec};
use crate::provider::{Provider, ResourceKind, ResourceSpec};
use crate::reconcile::Reconciliation;
use crate::store::Store;
use crate::task::{Task, TaskContext, TaskError, TaskFuture};

use super::{SECURITY_GROUP, create_recorded, destroy_surplus, survey};

/// Group every project owns; never destroyed.
pub const DEFAULT_GROUP: &str = "default";

/// Creates configured security groups with their rules and deletes
/// unconfigured groups other than [`DEFAULT_GROUP`]. Rules of existing
/// groups are left untouched.
pub struct SecurityGroupTask {
    provider: Arc<dyn Provider>,
    groups: BTreeMap<String, SecurityGroupSpec>,
    plan: Reconciliation,
}

impl SecurityGroupTask {
    /// Reads the environment's security groups.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the environment is undefined.
    pub fn new(context: &TaskContext) -> Result<Self, TaskError> {
        Ok(Self {
            provider: Arc::clone(context.provider()),
            groups: context.environment_config()?.security_groups.clone(),
            plan: Reconciliation::default(),
        })
    }
}

fn rule_request(group: &str, group_id: &str, rule: &RuleSpec) -> ResourceSpec {
    ResourceSpec::new(format!("{group}/{}", rule.direction))
        .with("security_group_id", group_id)
        .with("direction", rule.direction.as_str())
        .with("ethertype", rule.ethertype.as_str())
        .with_optional("protocol", rule.protocol.clone())
        .with_optional("port_range_min", rule.port_range_min)
        .with_optional("port_range_max", rule.port_range_max)
        .with_optional("remote_ip_prefix", rule.remote_ip_prefix.clone())
}

impl Task for SecurityGroupTask {
    fn introspect<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            let expected = self.groups.keys().cloned();
            self.plan = survey(
                self.provider.as_ref(),
                store,
                SECURITY_GROUP,
                ResourceKind::SecurityGroup,
                expected,
            )
            .await?;
            Ok(())
        })
    }

    fn build<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(async move {
            for name in &self.plan.to_create {
                let Some(group) = self.groups.get(name) else {
                    continue;
                };
                let spec = ResourceSpec::new(name.as_str())
                    .with_optional("description", group.description.clone());
                let created = create_recorded(
                    self.provider.as_ref(),
                    store,
                    SECURITY_GROUP,
                    ResourceKind::SecurityGroup,
                    &spec,
                )
                .await?;
                for rule in &group.rules {
                    let request = rule_request(name, &created.id, rule);
                    let rule = self
                        .provider
                        .create(ResourceKind::SecurityGroupRule, &request)
                        .await?;
                    debug!(group = %name, rule = %rule.id, "security group rule created");
                }
            }
            Ok(())
        })
    }

    fn destroy<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        Box::pin(destroy_surplus(
            self.provider.as_ref(),
            store,
            SECURITY_GROUP,
            ResourceKind::SecurityGroup,
            &self.plan.to_destroy,
            |group| group.name == DEFAULT_GROUP,
        ))
    }
}
