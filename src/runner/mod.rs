//! Lifecycle executor.
//!
//! A [`Runner`] owns one run: it builds the task graph once, instantiates
//! every task in forward order against a fresh [`Store`], then drives the
//! phases as barriers. Introspect, build and commission walk the forward
//! order; decommission and destroy walk it backwards. The first task error
//! aborts the run. Nothing is rolled back.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info};

use crate::graph::{ExecutionOrder, GraphError, TaskGraph};
use crate::store::Store;
use crate::task::{Phase, Task, TaskContext, TaskDescriptor, TaskError};

/// Errors surfaced by a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The task graph could not be built or ordered.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// A task factory failed.
    #[error("failed to load task `{task}`: {source}")]
    Instantiate {
        /// Identity of the task.
        task: String,
        /// Underlying task error.
        #[source]
        source: TaskError,
    },
    /// A phase failed.
    #[error("task `{task}` failed during {phase}: {source}")]
    Task {
        /// Identity of the task.
        task: String,
        /// Phase that failed.
        phase: Phase,
        /// Underlying task error.
        #[source]
        source: TaskError,
    },
}

/// One phase invocation performed by the runner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseInvocation {
    /// Phase that ran.
    pub phase: Phase,
    /// Task it ran on.
    pub task: String,
}

/// What a completed run did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Phase invocations in the order they happened.
    pub invocations: Vec<PhaseInvocation>,
    /// Tasks skipped at least once because they were disabled.
    pub skipped: BTreeSet<String>,
}

impl RunSummary {
    /// Tasks that ran `phase`, in order.
    #[must_use]
    pub fn tasks_for(&self, phase: Phase) -> Vec<&str> {
        self.invocations
            .iter()
            .filter(|invocation| invocation.phase == phase)
            .map(|invocation| invocation.task.as_str())
            .collect()
    }
}

/// Drives a set of tasks through the five lifecycle phases.
#[derive(Debug)]
pub struct Runner {
    context: TaskContext,
    descriptors: Vec<TaskDescriptor>,
    order: ExecutionOrder,
}

impl Runner {
    /// Builds and orders the task graph.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Graph`] for unknown references, duplicate
    /// identities and cycles.
    pub fn new(
        context: TaskContext,
        mut descriptors: Vec<TaskDescriptor>,
    ) -> Result<Self, RunError> {
        let graph = TaskGraph::build(descriptors.iter().map(TaskDescriptor::declaration))?;
        let order = graph.order()?;
        descriptors.sort_by_key(|descriptor| order.position(descriptor.provides()));
        Ok(Self {
            context,
            descriptors,
            order,
        })
    }

    /// Forward execution order.
    #[must_use]
    pub const fn order(&self) -> &ExecutionOrder {
        &self.order
    }

    /// Executes one complete run.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Instantiate`] when a factory fails and
    /// [`RunError::Task`] for the first failing phase.
    pub async fn execute(&self) -> Result<RunSummary, RunError> {
        let mut store = Store::new();
        let mut tasks = self.instantiate(&mut store)?;
        let mut summary = RunSummary::default();

        for phase in Phase::FORWARD {
            run_phase(phase, tasks.iter_mut(), &mut store, &mut summary).await?;
        }
        for phase in Phase::REVERSE {
            run_phase(phase, tasks.iter_mut().rev(), &mut store, &mut summary).await?;
        }

        info!(
            environment = self.context.environment(),
            invocations = summary.invocations.len(),
            "run complete"
        );
        Ok(summary)
    }

    fn instantiate(&self, store: &mut Store) -> Result<Vec<(String, Box<dyn Task>)>, RunError> {
        let mut tasks = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let identity = descriptor.provides();
            debug!(task = identity, "loading task");
            let task = descriptor
                .instantiate(&self.context, store)
                .map_err(|source| RunError::Instantiate {
                    task: identity.to_owned(),
                    source,
                })?;
            tasks.push((identity.to_owned(), task));
        }
        Ok(tasks)
    }
}

async fn run_phase<'t, I>(
    phase: Phase,
    tasks: I,
    store: &mut Store,
    summary: &mut RunSummary,
) -> Result<(), RunError>
where
    I: Iterator<Item = &'t mut (String, Box<dyn Task>)>,
{
    info!(%phase, "executing {phase} phase");
    for (identity, task) in tasks {
        if !task.enabled() {
            debug!(task = %identity, %phase, "task disabled; skipping");
            summary.skipped.insert(identity.clone());
            continue;
        }
        info!(task = %identity, %phase, "running {phase} for task: {identity}");
        phase
            .invoke(task.as_mut(), store)
            .await
            .map_err(|source| RunError::Task {
                task: identity.clone(),
                phase,
                source,
            })?;
        summary.invocations.push(PhaseInvocation {
            phase,
            task: identity.clone(),
        });
    }
    Ok(())
}
