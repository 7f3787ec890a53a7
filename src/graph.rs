//! The work graph of one build invocation.
//!
//! Tasks are added to a mutable [`WorkGraph`] and refer to each other by
//! [`TaskId`]. [`WorkGraph::freeze`] resolves those references, validates the
//! declarations and rejects cycles, producing a [`FrozenGraph`] that the
//! scheduler only ever reads.
//!
//! ## Edges
//!
//! Tasks live in a `petgraph` arena and are addressed by [`NodeIndex`]. Every
//! edge points from the task that has to come first to the task that comes
//! after it, and is weighted with the [`EdgeKind`] that put it there:
//!
//! * `b.depends_on(a)` adds `a -> b` (`DependsOn`): `b` starts after `a`
//!   reached a terminal state and is skipped if `a` fails.
//! * `b.must_run_after(a)` adds `a -> b` (`MustRunAfter`): ordering only.
//! * `a.finalized_by(f)` adds `a -> f` (`FinalizedBy`): `f` runs after `a`
//!   whatever happened to it.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::core::TaskId;
use crate::error::ConfigError;
use crate::task::TaskNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    DependsOn,
    MustRunAfter,
    FinalizedBy,
}

impl EdgeKind {
    fn label(self) -> &'static str {
        match self {
            EdgeKind::DependsOn => "dependsOn",
            EdgeKind::MustRunAfter => "mustRunAfter",
            EdgeKind::FinalizedBy => "finalizedBy",
        }
    }
}

/// A graph under construction.
#[derive(Debug, Default)]
pub struct WorkGraph {
    graph: Graph<TaskNode, EdgeKind>,
    index: HashMap<TaskId, NodeIndex>,
}

impl WorkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, task: TaskNode) -> Result<NodeIndex, ConfigError> {
        if self.index.contains_key(&task.id) {
            return Err(ConfigError::DuplicateTask(task.id));
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.index.insert(id, index);
        Ok(index)
    }

    /// Declares that `task` has a `kind` relation to `other`, exactly as the
    /// builder method of the same name on [`TaskNode`] would.
    pub fn add_edge(
        &mut self,
        task: &TaskId,
        kind: EdgeKind,
        other: impl Into<TaskId>,
    ) -> Result<(), ConfigError> {
        let &index = self
            .index
            .get(task)
            .ok_or_else(|| ConfigError::UnknownTask {
                task: task.clone(),
                referenced: task.clone(),
            })?;

        let node = &mut self.graph[index];
        let other = other.into();
        match kind {
            EdgeKind::DependsOn => node.depends_on.push(other),
            EdgeKind::MustRunAfter => node.must_run_after.push(other),
            EdgeKind::FinalizedBy => node.finalized_by.push(other),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, task: &str) -> bool {
        self.index.contains_key(task)
    }

    fn resolve(&self, task: &TaskId, referenced: &TaskId) -> Result<NodeIndex, ConfigError> {
        self.index
            .get(referenced)
            .copied()
            .ok_or_else(|| ConfigError::UnknownTask {
                task: task.clone(),
                referenced: referenced.clone(),
            })
    }

    /// Validates the graph and fixes its structure.
    pub fn freeze(mut self) -> Result<FrozenGraph, ConfigError> {
        let mut edges = Vec::new();

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            validate_properties(task)?;

            for dependency in &task.depends_on {
                edges.push((self.resolve(&task.id, dependency)?, index, EdgeKind::DependsOn));
            }
            for before in &task.must_run_after {
                edges.push((self.resolve(&task.id, before)?, index, EdgeKind::MustRunAfter));
            }
            for finalizer in &task.finalized_by {
                edges.push((index, self.resolve(&task.id, finalizer)?, EdgeKind::FinalizedBy));
            }
        }

        let mut seen = HashSet::new();
        for (from, to, kind) in edges {
            if seen.insert((from, to, kind)) {
                self.graph.add_edge(from, to, kind);
            }
        }

        if let Some(cycle) = find_cycle(&self.graph) {
            return Err(ConfigError::Cycle(cycle));
        }

        tracing::debug!(
            tasks = self.graph.node_count(),
            edges = self.graph.edge_count(),
            "froze work graph"
        );

        Ok(FrozenGraph {
            graph: self.graph,
            index: self.index,
        })
    }
}

fn validate_properties(task: &TaskNode) -> Result<(), ConfigError> {
    let mut names = HashSet::new();

    let declared = task
        .inputs
        .iter()
        .map(|input| input.name.as_str())
        .chain(task.outputs.iter().map(|output| output.name.as_str()));

    for name in declared {
        if !names.insert(name) {
            return Err(ConfigError::DuplicateProperty {
                task: task.id.clone(),
                property: name.to_string(),
            });
        }
    }

    for input in &task.inputs {
        if input.value.is_none() && !input.optional {
            return Err(ConfigError::MissingInput {
                task: task.id.clone(),
                property: input.name.clone(),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search with three-color marking. Returns the first cycle found
/// as a closed path, e.g. `[a, b, a]`.
fn find_cycle(graph: &Graph<TaskNode, EdgeKind>) -> Option<Vec<TaskId>> {
    let successors = |node: NodeIndex| -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
        // visit in declaration order
        next.sort_unstable_by(|a, b| b.cmp(a));
        next.dedup();
        next
    };

    let mut marks = vec![Mark::Unvisited; graph.node_count()];

    for start in graph.node_indices() {
        if marks[start.index()] != Mark::Unvisited {
            continue;
        }

        marks[start.index()] = Mark::InProgress;
        let mut stack = vec![(start, successors(start))];

        while let Some((node, children)) = stack.last_mut() {
            let node = *node;
            let Some(next) = children.pop() else {
                marks[node.index()] = Mark::Done;
                stack.pop();
                continue;
            };

            match marks[next.index()] {
                Mark::Unvisited => {
                    marks[next.index()] = Mark::InProgress;
                    stack.push((next, successors(next)));
                }
                Mark::InProgress => {
                    let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    let mut cycle: Vec<TaskId> = stack[from..]
                        .iter()
                        .map(|(n, _)| graph[*n].id.clone())
                        .collect();
                    cycle.push(graph[next].id.clone());
                    return Some(cycle);
                }
                Mark::Done => {}
            }
        }
    }

    None
}

/// A validated, acyclic work graph.
#[derive(Debug)]
pub struct FrozenGraph {
    graph: Graph<TaskNode, EdgeKind>,
    index: HashMap<TaskId, NodeIndex>,
}

impl FrozenGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn task(&self, index: NodeIndex) -> &TaskNode {
        &self.graph[index]
    }

    pub fn index_of(&self, task: &str) -> Option<NodeIndex> {
        self.index.get(task).copied()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> + '_ {
        self.graph.node_weights()
    }

    /// Tasks that have to come before `index` through an edge of `kind`.
    pub fn predecessors(&self, index: NodeIndex, kind: EdgeKind) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter(|edge| *edge.weight() == kind)
            .map(|edge| edge.source())
            .collect()
    }

    /// Tasks that come after `index` through an edge of `kind`.
    pub fn successors(&self, index: NodeIndex, kind: EdgeKind) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .filter(|edge| *edge.weight() == kind)
            .map(|edge| edge.target())
            .collect()
    }

    /// Whether `index` only exists in the graph to finalize other tasks.
    pub fn is_finalizer(&self, index: NodeIndex) -> bool {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .any(|edge| *edge.weight() == EdgeKind::FinalizedBy)
    }

    /// Tasks that have not started yet and whose predecessors, through edges
    /// of every kind, are all in `completed`.
    pub fn ready_nodes(
        &self,
        completed: &HashSet<NodeIndex>,
        started: &HashSet<NodeIndex>,
    ) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|index| !started.contains(index) && !completed.contains(index))
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|before| completed.contains(&before))
            })
            .collect()
    }
}

/// Renders the graph as a Mermaid diagram.
impl Display for FrozenGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].id.as_str().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                edge.weight().label(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
