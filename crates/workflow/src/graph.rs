//! Workflow construction and DAG validation using petgraph.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use steward_core::{Error, ManagedObject, Result};
use tracing::debug;

use crate::context::Context;
use crate::dependent::Capability;
use crate::executor;
use crate::node::{Dependent, NodeRuntime};
use crate::result::{WorkflowMode, WorkflowResult};

/// Default bound on sibling nodes running at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

pub(crate) struct WorkflowNode {
    pub(crate) name: String,
    pub(crate) runtime: Arc<dyn NodeRuntime>,
    pub(crate) predecessors: Vec<usize>,
    pub(crate) successors: Vec<usize>,
}

/// A validated, immutable dependent-resource DAG.
///
/// Built once per controller and shared by every dispatch.
pub struct Workflow {
    name: String,
    nodes: Vec<WorkflowNode>,
    topological: Vec<usize>,
    max_concurrency: usize,
}

impl Workflow {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Node names in one valid topological order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        self.topological
            .iter()
            .filter_map(|idx| self.nodes.get(*idx))
            .map(|node| node.name.as_str())
            .collect()
    }

    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Option<Vec<&str>> {
        self.node(name).map(|node| self.names(&node.predecessors))
    }

    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Option<Vec<&str>> {
        self.node(name).map(|node| self.names(&node.successors))
    }

    #[must_use]
    pub fn capability_of(&self, name: &str) -> Option<Capability> {
        self.node(name).map(|node| node.runtime.capability())
    }

    /// Whether cleanup has anything to delete.
    #[must_use]
    pub fn has_mutating_nodes(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| node.runtime.capability().is_mutating())
    }

    /// Run in topological order.
    pub async fn reconcile(&self, primary: &ManagedObject, ctx: &Context) -> WorkflowResult {
        executor::run(self, WorkflowMode::Reconcile, primary, ctx).await
    }

    /// Run in reverse topological order.
    pub async fn cleanup(&self, primary: &ManagedObject, ctx: &Context) -> WorkflowResult {
        executor::run(self, WorkflowMode::Cleanup, primary, ctx).await
    }

    pub(crate) fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    pub(crate) fn topological_indices(&self) -> &[usize] {
        &self.topological
    }

    fn node(&self, name: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.name == name)
    }

    fn names(&self, indices: &[usize]) -> Vec<&str> {
        indices
            .iter()
            .filter_map(|idx| self.nodes.get(*idx))
            .map(|node| node.name.as_str())
            .collect()
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("order", &self.topological_order())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

struct PendingNode {
    name: String,
    depends_on: Vec<String>,
    runtime: Arc<dyn NodeRuntime>,
}

/// Builder for [`Workflow`].
///
/// # Example
///
/// ```ignore
/// let workflow = WorkflowBuilder::new("webapp")
///     .add(Dependent::mutating("config", ConfigMapDependent))
///     .add(Dependent::bulk("pods", PodSet).depends_on("config"))
///     .with_max_concurrency(2)
///     .build()?;
/// ```
pub struct WorkflowBuilder {
    name: String,
    pending: Vec<PendingNode>,
    max_concurrency: usize,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: Vec::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    #[must_use]
    pub fn add<R>(mut self, dependent: Dependent<R>) -> Self
    where
        R: Send + Sync + 'static,
    {
        let (name, depends_on, runtime) = dependent.into_parts();
        self.pending.push(PendingNode {
            name,
            depends_on,
            runtime,
        });
        self
    }

    /// Bound on sibling nodes running at once. Zero is treated as one.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Validate the graph and freeze it.
    ///
    /// # Errors
    ///
    /// - `DuplicateNode` if two dependents share a name
    /// - `UnknownDependency` if a dependency names no declared dependent
    /// - `CyclicGraph` naming one cycle if the dependencies are not acyclic
    pub fn build(self) -> Result<Workflow> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

        for (position, node) in self.pending.iter().enumerate() {
            if index_of.contains_key(node.name.as_str()) {
                return Err(Error::DuplicateNode {
                    name: node.name.clone(),
                });
            }
            index_of.insert(node.name.as_str(), graph.add_node(position));
        }

        for node in &self.pending {
            let to = index_of
                .get(node.name.as_str())
                .copied()
                .ok_or_else(|| Error::invalid_config(format!("node '{}' vanished", node.name)))?;
            for dependency in &node.depends_on {
                let from = index_of.get(dependency.as_str()).copied().ok_or_else(|| {
                    Error::UnknownDependency {
                        node: node.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                graph.update_edge(from, to, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| Error::CyclicGraph {
            nodes: describe_cycle(&graph, cycle.node_id(), &self.pending),
        })?;
        let topological: Vec<usize> = sorted.iter().map(|idx| idx.index()).collect();

        let nodes: Vec<WorkflowNode> = self
            .pending
            .into_iter()
            .enumerate()
            .map(|(position, node)| {
                let idx = NodeIndex::new(position);
                WorkflowNode {
                    name: node.name,
                    runtime: node.runtime,
                    predecessors: neighbors(&graph, idx, Direction::Incoming),
                    successors: neighbors(&graph, idx, Direction::Outgoing),
                }
            })
            .collect();

        debug!(
            workflow = %self.name,
            order = %topological
                .iter()
                .filter_map(|idx| nodes.get(*idx))
                .map(|node| node.name.as_str())
                .join(" -> "),
            "Built workflow"
        );
        Ok(Workflow {
            name: self.name,
            nodes,
            topological,
            max_concurrency: self.max_concurrency,
        })
    }
}

fn neighbors(graph: &DiGraph<usize, ()>, idx: NodeIndex, direction: Direction) -> Vec<usize> {
    let mut found: Vec<usize> = graph
        .neighbors_directed(idx, direction)
        .map(|n| n.index())
        .collect();
    found.sort_unstable();
    found
}

/// Names along one concrete cycle through `start`'s strongly connected
/// component, closed by repeating the first name.
fn describe_cycle(
    graph: &DiGraph<usize, ()>,
    start: NodeIndex,
    pending: &[PendingNode],
) -> Vec<String> {
    let name_of = |idx: NodeIndex| {
        graph
            .node_weight(idx)
            .and_then(|position| pending.get(*position))
            .map_or_else(|| format!("#{}", idx.index()), |node| node.name.clone())
    };

    let component: HashSet<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .map(|scc| scc.into_iter().collect())
        .unwrap_or_default();

    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = graph
            .neighbors_directed(current, Direction::Outgoing)
            .filter(|n| component.contains(n))
            .min_by_key(|n| n.index());
        let Some(next) = next else {
            break;
        };
        if let Some((position, _)) = path.iter().find_position(|seen| **seen == next) {
            let mut cycle: Vec<String> = path
                .get(position..)
                .unwrap_or_default()
                .iter()
                .map(|idx| name_of(*idx))
                .collect();
            cycle.push(name_of(next));
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.into_iter().map(name_of).collect()
}
