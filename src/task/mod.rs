//! Task contract driven by the lifecycle executor.
//!
//! A task provisions one resource kind. It declares the identity it
//! provides and the identities it must run after (`depends`) or before
//! (`rdepends`), and implements any of the five lifecycle phases. Phases it
//! does not implement are no-ops.

use std::fmt;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, Document, Environment, Settings};
use crate::graph::Declaration;
use crate::provider::{Provider, ProviderError};
use crate::store::{Store, StoreError};
use crate::transport::{Connector, TransportError};

/// The five lifecycle phases in execution order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    /// Query provider state and compute reconciliation sets.
    Introspect,
    /// Create resources.
    Build,
    /// Post-creation activation such as attaching interfaces.
    Commission,
    /// Pre-deletion steps.
    Decommission,
    /// Delete surplus resources.
    Destroy,
}

impl Phase {
    /// Phases run in forward dependency order.
    pub const FORWARD: [Self; 3] = [Self::Introspect, Self::Build, Self::Commission];
    /// Phases run in reverse dependency order.
    pub const REVERSE: [Self; 2] = [Self::Decommission, Self::Destroy];

    /// Lower-case phase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Introspect => "introspect",
            Self::Build => "build",
            Self::Commission => "commission",
            Self::Decommission => "decommission",
            Self::Destroy => "destroy",
        }
    }

    /// Returns `true` for the reverse-order phases.
    #[must_use]
    pub const fn is_teardown(self) -> bool {
        matches!(self, Self::Decommission | Self::Destroy)
    }

    /// Invokes this phase on `task`.
    pub fn invoke<'a>(self, task: &'a mut dyn Task, store: &'a mut Store) -> TaskFuture<'a> {
        match self {
            Self::Introspect => task.introspect(store),
            Self::Build => task.build(store),
            Self::Commission => task.commission(store),
            Self::Decommission => task.decommission(store),
            Self::Destroy => task.destroy(store),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by tasks.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Configuration the task needs is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A name could not be resolved to a provider identifier.
    #[error("{kind} `{name}` not found")]
    NotFound {
        /// Kind of the missing resource.
        kind: String,
        /// Name that was looked up.
        name: String,
    },
    /// The provider rejected a request.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    /// The remote transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A fact expected in the store is absent or mistyped.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// A provisioner command exited unsuccessfully.
    #[error("provisioner for `{instance}` failed with status {code:?}: {stderr}")]
    Provisioner {
        /// Instance being provisioned.
        instance: String,
        /// Exit status, if any.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}

impl TaskError {
    /// Builds a [`TaskError::NotFound`].
    #[must_use]
    pub fn not_found(kind: impl fmt::Display, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }
}

/// Future returned by task phases.
pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'a>>;

fn noop<'a>() -> TaskFuture<'a> {
    Box::pin(future::ready(Ok(())))
}

/// One unit of provisioning.
///
/// Every phase receives the run's [`Store`]. Predecessors in the current
/// phase's order have already run, so facts they publish are available.
pub trait Task: Send {
    /// Whether the task takes part in this run. Checked before every phase;
    /// a disabled task keeps its position in the order but does nothing.
    fn enabled(&self) -> bool {
        true
    }

    /// Queries provider state and computes what to create and destroy.
    fn introspect<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        let _ = store;
        noop()
    }

    /// Creates missing resources.
    fn build<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        let _ = store;
        noop()
    }

    /// Activates created resources.
    fn commission<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        let _ = store;
        noop()
    }

    /// Prepares surplus resources for deletion.
    fn decommission<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        let _ = store;
        noop()
    }

    /// Deletes surplus resources.
    fn destroy<'a>(&'a mut self, store: &'a mut Store) -> TaskFuture<'a> {
        let _ = store;
        noop()
    }
}

/// Everything a task factory may draw on.
#[derive(Clone)]
pub struct TaskContext {
    environment: String,
    document: Arc<Document>,
    settings: Arc<Settings>,
    provider: Arc<dyn Provider>,
    connector: Arc<dyn Connector>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    /// Bundles the run's collaborators.
    #[must_use]
    pub fn new(
        environment: impl Into<String>,
        document: Arc<Document>,
        settings: Arc<Settings>,
        provider: Arc<dyn Provider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            environment: environment.into(),
            document,
            settings,
            provider,
            connector,
        }
    }

    /// Name of the environment being reconciled.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The whole environment document.
    #[must_use]
    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    /// The selected environment's definition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownEnvironment`] when it is not defined.
    pub fn environment_config(&self) -> Result<&Environment, ConfigError> {
        self.document.environment(&self.environment)
    }

    /// Operator settings.
    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Cloud provider client.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Transport connector.
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }
}

/// Constructor stored in a [`TaskDescriptor`].
pub type TaskFactory =
    dyn Fn(&TaskContext, &mut Store) -> Result<Box<dyn Task>, TaskError> + Send + Sync;

/// Registry entry: identity, dependency metadata and constructor.
#[derive(Clone)]
pub struct TaskDescriptor {
    provides: String,
    depends: Vec<String>,
    rdepends: Vec<String>,
    factory: Arc<TaskFactory>,
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("provides", &self.provides)
            .field("depends", &self.depends)
            .field("rdepends", &self.rdepends)
            .finish_non_exhaustive()
    }
}

impl TaskDescriptor {
    /// Creates a descriptor with no dependencies.
    pub fn new<F>(provides: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&TaskContext, &mut Store) -> Result<Box<dyn Task>, TaskError> + Send + Sync + 'static,
    {
        Self {
            provides: provides.into(),
            depends: Vec::new(),
            rdepends: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// Declares identities that must run first.
    #[must_use]
    pub fn depends<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends.extend(identities.into_iter().map(Into::into));
        self
    }

    /// Declares identities that must run after this task.
    #[must_use]
    pub fn rdepends<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rdepends.extend(identities.into_iter().map(Into::into));
        self
    }

    /// Identity this task provides.
    #[must_use]
    pub fn provides(&self) -> &str {
        &self.provides
    }

    /// Dependency metadata for graph construction.
    #[must_use]
    pub fn declaration(&self) -> Declaration<'_> {
        Declaration {
            provides: &self.provides,
            depends: &self.depends,
            rdepends: &self.rdepends,
        }
    }

    /// Constructs the task for one run.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error.
    pub fn instantiate(
        &self,
        context: &TaskContext,
        store: &mut Store,
    ) -> Result<Box<dyn Task>, TaskError> {
        (self.factory)(context, store)
    }
}
