//! Create/update/destroy planning shared by the concrete tasks.
//!
//! During `introspect` a task lists existing resources, derives the expected
//! names from configuration and calls [`Reconciliation::compute`]. The raw
//! listing is published with [`publish`] so dependants can resolve names to
//! identifiers through [`resolve_id`]. `build` acts on
//! [`Reconciliation::to_create`], `destroy` on [`Reconciliation::to_destroy`],
//! and [`tolerate_absent`] turns "already gone" into a logged no-op.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{info, warn};

use crate::provider::{ProviderError, Resource, ResourceKind};
use crate::store::{self, Store};
use crate::task::TaskError;

/// Disjoint name sets partitioning `expected ∪ existing`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reconciliation {
    /// Expected but not existing.
    pub to_create: BTreeSet<String>,
    /// Expected and existing. Updates are reserved; tasks only log them.
    pub to_update: BTreeSet<String>,
    /// Existing but not expected.
    pub to_destroy: BTreeSet<String>,
}

impl Reconciliation {
    /// Diffs expected names against existing names.
    ///
    /// ```
    /// use contractor::reconcile::Reconciliation;
    ///
    /// let plan = Reconciliation::compute(["a", "b"], ["b", "c"]);
    /// assert!(plan.to_create.contains("a"));
    /// assert!(plan.to_update.contains("b"));
    /// assert!(plan.to_destroy.contains("c"));
    /// ```
    pub fn compute<E, X, S, T>(expected: E, existing: X) -> Self
    where
        E: IntoIterator<Item = S>,
        X: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let wanted: BTreeSet<String> = expected.into_iter().map(Into::into).collect();
        let present: BTreeSet<String> = existing.into_iter().map(Into::into).collect();
        Self {
            to_create: wanted.difference(&present).cloned().collect(),
            to_update: wanted.intersection(&present).cloned().collect(),
            to_destroy: present.difference(&wanted).cloned().collect(),
        }
    }

    /// Returns `true` when nothing needs creating or destroying.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.to_create.is_empty() && self.to_destroy.is_empty()
    }

    /// Logs the plan for `kind` before any action is taken.
    pub fn log(&self, kind: ResourceKind) {
        info!(
            %kind,
            create = self.to_create.len(),
            update = self.to_update.len(),
            destroy = self.to_destroy.len(),
            "{kind} TODO - {self}"
        );
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "C({}) U({}) D({})",
            self.to_create.len(),
            self.to_update.len(),
            self.to_destroy.len()
        )
    }
}

/// Store key under which a task publishes its listing of `kind`.
#[must_use]
pub fn existing_key(task: &str) -> String {
    store::key(task, "existing")
}

/// Publishes `resources` as `task`'s listing.
pub fn publish(store: &mut Store, task: &str, resources: Vec<Resource>) {
    store.insert(existing_key(task), resources);
}

/// Store key under which a task publishes its [`Reconciliation`].
#[must_use]
pub fn plan_key(task: &str) -> String {
    store::key(task, "plan")
}

/// Publishes `plan` so later tasks can see what `task` will create or
/// destroy.
pub fn publish_plan(store: &mut Store, task: &str, plan: &Reconciliation) {
    store.insert(plan_key(task), plan.clone());
}

/// Returns the plan `task` published during introspection.
///
/// # Errors
///
/// Returns [`TaskError::Store`] when no plan was published.
pub fn plan<'s>(store: &'s Store, task: &str) -> Result<&'s Reconciliation, TaskError> {
    Ok(store.get::<Reconciliation>(&plan_key(task))?)
}

/// Identifiers of every listed resource named `name`. Providers allow
/// duplicate names, so there may be several.
///
/// # Errors
///
/// Returns [`TaskError::Store`] when the listing was never published.
pub fn ids_named(store: &Store, task: &str, name: &str) -> Result<Vec<String>, TaskError> {
    Ok(store
        .get::<Vec<Resource>>(&existing_key(task))?
        .iter()
        .filter(|resource| resource.name == name)
        .map(|resource| resource.id.clone())
        .collect())
}

/// Appends a newly created resource to `task`'s listing.
///
/// # Errors
///
/// Returns [`TaskError::Store`] when the listing was never published.
pub fn record_created(store: &mut Store, task: &str, resource: Resource) -> Result<(), TaskError> {
    store
        .get_mut::<Vec<Resource>>(&existing_key(task))?
        .push(resource);
    Ok(())
}

/// Removes a deleted resource from `task`'s listing.
///
/// # Errors
///
/// Returns [`TaskError::Store`] when the listing was never published.
pub fn record_destroyed(store: &mut Store, task: &str, id: &str) -> Result<(), TaskError> {
    store
        .get_mut::<Vec<Resource>>(&existing_key(task))?
        .retain(|resource| resource.id != id);
    Ok(())
}

/// Finds `name` in `task`'s published listing.
///
/// # Errors
///
/// Returns [`TaskError::Store`] when the listing is absent and
/// [`TaskError::NotFound`] when no resource carries the name.
pub fn lookup<'s>(
    store: &'s Store,
    task: &str,
    kind: ResourceKind,
    name: &str,
) -> Result<&'s Resource, TaskError> {
    store
        .get::<Vec<Resource>>(&existing_key(task))?
        .iter()
        .find(|resource| resource.name == name)
        .ok_or_else(|| TaskError::not_found(kind, name))
}

/// Resolves `name` to its provider identifier via `task`'s listing.
///
/// # Errors
///
/// Same conditions as [`lookup`].
pub fn resolve_id(
    store: &Store,
    task: &str,
    kind: ResourceKind,
    name: &str,
) -> Result<String, TaskError> {
    lookup(store, task, kind, name).map(|resource| resource.id.clone())
}

/// Treats a not-found provider error as success, logging it.
///
/// # Errors
///
/// Returns every other provider error unchanged.
pub fn tolerate_absent(
    result: Result<(), ProviderError>,
    kind: ResourceKind,
    name: &str,
) -> Result<(), ProviderError> {
    match result {
        Err(err) if err.is_not_found() => {
            warn!(%kind, name, "already gone; continuing");
            Ok(())
        }
        other => other,
    }
}
