//! Task dependency graph and deterministic topological scheduling.
//!
//! Vertices are task identities. A task's `depends` entries become edges
//! pointing at the task and its `rdepends` entries become edges leaving it.
//! [`TaskGraph::order`] linearises the graph with Kahn's algorithm, breaking
//! ties by lexical order of identity so repeated runs log the same sequence.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, instrument};

/// Errors raised while building or sorting the task graph.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GraphError {
    /// Raised when two tasks declare the same identity.
    #[error("task identity `{identity}` is provided more than once")]
    DuplicateIdentity {
        /// Identity declared twice.
        identity: String,
    },
    /// Raised when a dependency names an identity no task provides.
    #[error("task `{task}` references unknown task `{dependency}`")]
    UnknownDependency {
        /// Task carrying the declaration.
        task: String,
        /// Identity that could not be resolved.
        dependency: String,
    },
    /// Raised when the dependency declarations contain a cycle.
    #[error("cyclic dependency detected at task `{vertex}` ({})", .cycle.join(" -> "))]
    CyclicDependency {
        /// A vertex that lies on the cycle.
        vertex: String,
        /// The cycle, starting and ending at `vertex`.
        cycle: Vec<String>,
    },
}

impl GraphError {
    /// Returns `true` for errors caused by unresolvable configuration rather
    /// than by a cycle.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateIdentity { .. } | Self::UnknownDependency { .. }
        )
    }
}

/// Dependency metadata for one task, borrowed from its descriptor.
#[derive(Clone, Copy, Debug)]
pub struct Declaration<'a> {
    /// Identity the task provides.
    pub provides: &'a str,
    /// Identities whose phases must run before this task's.
    pub depends: &'a [String],
    /// Identities that must be treated as depending on this task.
    pub rdepends: &'a [String],
}

/// Immutable "must run before" graph over task identities.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskGraph {
    successors: BTreeMap<String, BTreeSet<String>>,
    predecessors: BTreeMap<String, BTreeSet<String>>,
}

impl TaskGraph {
    /// Builds the graph from the declarations of every discovered task.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateIdentity`] when an identity repeats and
    /// [`GraphError::UnknownDependency`] when an edge references an identity
    /// no declaration provides. Cycles are reported by [`TaskGraph::order`].
    #[instrument(skip_all)]
    pub fn build<'a, I>(declarations: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = Declaration<'a>>,
    {
        let collected: Vec<Declaration<'a>> = declarations.into_iter().collect();
        let mut graph = Self::default();

        for declaration in &collected {
            if graph.successors.contains_key(declaration.provides) {
                return Err(GraphError::DuplicateIdentity {
                    identity: declaration.provides.to_owned(),
                });
            }
            graph
                .successors
                .insert(declaration.provides.to_owned(), BTreeSet::new());
            graph
                .predecessors
                .insert(declaration.provides.to_owned(), BTreeSet::new());
        }

        for declaration in &collected {
            for dependency in declaration.depends {
                graph.connect(declaration.provides, dependency, declaration.provides)?;
            }
            for dependent in declaration.rdepends {
                graph.connect(declaration.provides, declaration.provides, dependent)?;
            }
        }

        debug!(
            tasks = graph.len(),
            edges = graph.edge_count(),
            "task graph built"
        );
        Ok(graph)
    }

    fn connect(&mut self, task: &str, from: &str, to: &str) -> Result<(), GraphError> {
        for endpoint in [from, to] {
            if !self.successors.contains_key(endpoint) {
                return Err(GraphError::UnknownDependency {
                    task: task.to_owned(),
                    dependency: endpoint.to_owned(),
                });
            }
        }
        if let Some(next) = self.successors.get_mut(from) {
            next.insert(to.to_owned());
        }
        if let Some(previous) = self.predecessors.get_mut(to) {
            previous.insert(from.to_owned());
        }
        Ok(())
    }

    /// Number of vertices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.successors.len()
    }

    /// Returns `true` when the graph has no vertices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    /// Returns `true` when `identity` is a vertex.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.successors.contains_key(identity)
    }

    /// Number of distinct edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.successors.values().map(BTreeSet::len).sum()
    }

    /// Every edge as `(before, after)`, in lexical order.
    #[must_use]
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.successors
            .iter()
            .flat_map(|(from, targets)| {
                targets
                    .iter()
                    .map(move |to| (from.as_str(), to.as_str()))
            })
            .collect()
    }

    /// Linearises the graph into a forward execution order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] naming a vertex on a cycle when
    /// no topological order exists. A partial order is never returned.
    #[instrument(skip_all, fields(tasks = self.len()))]
    pub fn order(&self) -> Result<ExecutionOrder, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .predecessors
            .iter()
            .map(|(vertex, previous)| (vertex.as_str(), previous.len()))
            .collect();
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(vertex, _)| *vertex)
            .collect();
        let mut forward = Vec::with_capacity(self.len());

        while let Some(vertex) = ready.pop_first() {
            forward.push(vertex.to_owned());
            in_degree.remove(vertex);
            for next in self.successors.get(vertex).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(next.as_str());
                    }
                }
            }
        }

        if in_degree.is_empty() {
            debug!(order = ?forward, "execution order computed");
            return Ok(ExecutionOrder { forward });
        }

        let remaining: BTreeSet<&str> = in_degree.keys().copied().collect();
        Err(self.cycle_error(&remaining))
    }

    /// Walks predecessor edges within the unsorted remainder until a vertex
    /// repeats. Every remaining vertex has a remaining predecessor, so the
    /// walk always closes a cycle.
    fn cycle_error(&self, remaining: &BTreeSet<&str>) -> GraphError {
        let Some(start) = remaining.first().copied() else {
            return GraphError::CyclicDependency {
                vertex: String::new(),
                cycle: Vec::new(),
            };
        };
        let mut path: Vec<&str> = vec![start];
        let mut current = start;
        loop {
            let previous = self
                .predecessors
                .get(current)
                .and_then(|set| set.iter().find(|p| remaining.contains(p.as_str())));
            let Some(previous) = previous.map(String::as_str) else {
                break;
            };
            if let Some(position) = path.iter().position(|seen| *seen == previous) {
                let mut cycle: Vec<String> = path
                    .iter()
                    .skip(position)
                    .rev()
                    .map(|vertex| (*vertex).to_owned())
                    .collect();
                cycle.insert(0, previous.to_owned());
                return GraphError::CyclicDependency {
                    vertex: previous.to_owned(),
                    cycle,
                };
            }
            path.push(previous);
            current = previous;
        }
        GraphError::CyclicDependency {
            vertex: start.to_owned(),
            cycle: vec![start.to_owned()],
        }
    }
}

/// Forward execution order; teardown walks the same sequence backwards.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecutionOrder {
    forward: Vec<String>,
}

impl ExecutionOrder {
    /// Order used for introspect, build and commission.
    #[must_use]
    pub fn forward(&self) -> &[String] {
        &self.forward
    }

    /// Order used for decommission and destroy: the forward order reversed.
    pub fn reverse(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.forward.iter().rev().map(String::as_str)
    }

    /// Position of `identity` in the forward order.
    #[must_use]
    pub fn position(&self, identity: &str) -> Option<usize> {
        self.forward.iter().position(|vertex| vertex == identity)
    }

    /// Number of tasks in the order.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Returns `true` when there is nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
