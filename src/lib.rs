//! Core library for the contractor provisioning orchestrator.
//!
//! A run reconciles one environment of a declarative document against an
//! OpenStack project. Concrete [`tasks`] declare what they depend on; the
//! [`graph`] orders them and the [`runner`] drives every task through the
//! introspect, build and commission phases in that order, then through
//! decommission and destroy in reverse. Tasks share facts through a
//! run-scoped [`store`] and reach private networks through SSH [`tunnel`]s
//! opened on a beachhead host.

pub mod config;
pub mod graph;
pub mod provider;
pub mod reconcile;
pub mod runner;
pub mod store;
pub mod task;
pub mod tasks;
pub mod test_support;
pub mod transport;
pub mod tunnel;

pub use config::{ConfigError, Document, Settings};
pub use graph::{ExecutionOrder, GraphError, TaskGraph};
pub use provider::{OpenStackProvider, Provider, ProviderError, Resource, ResourceKind, RetryPolicy};
pub use runner::{RunError, RunSummary, Runner};
pub use store::{Store, StoreError};
pub use task::{Phase, Task, TaskContext, TaskDescriptor, TaskError};
pub use tasks::registry;
pub use transport::{
    Connection, Connector, ProcessCommandRunner, SshConnector, SshTarget, Transport,
    TransportError,
};
pub use tunnel::Tunnel;
