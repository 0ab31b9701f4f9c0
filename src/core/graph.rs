//! Task dependency graph and wave computation.
//!
//! `TaskGraph` stores tasks in a petgraph `DiGraph` with an edge from each
//! dependency to its dependent. Waves are the layers of Kahn's algorithm;
//! readiness is recomputed from live task statuses every scheduling round.

use crate::core::task::{check_artifact_path, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::flog_warn;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// The task dependency graph.
pub struct TaskGraph {
    /// Edges run from a dependency to the task that needs it.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// `(task, missing dependency)` pairs that reference no task.
    dangling: Vec<(TaskId, TaskId)>,
    /// Reject dangling dependencies in `validate` instead of ignoring them.
    strict: bool,
}

impl TaskGraph {
    /// Build a graph from a task list.
    ///
    /// # Errors
    /// Returns an error if two tasks share an id or an artifact path, or if
    /// an artifact path leaves the project root.
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();
        let mut producers: HashMap<PathBuf, TaskId> = HashMap::new();

        for task in tasks {
            check_artifact_path(task.id, &task.path)?;
            if task_index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            if let Some(first) = producers.insert(task.path.clone(), task.id) {
                return Err(Error::DuplicateArtifact {
                    path: task.path.display().to_string(),
                    first,
                    second: task.id,
                });
            }
            let id = task.id;
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        let mut dangling = Vec::new();
        let mut edges = Vec::new();
        for (&id, &index) in &task_index {
            for dep in &graph[index].dependencies {
                match task_index.get(dep) {
                    Some(&dep_index) => edges.push((dep_index, index)),
                    None => dangling.push((id, *dep)),
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }
        dangling.sort();

        Ok(Self {
            graph,
            task_index,
            dangling,
            strict: true,
        })
    }

    /// Choose whether `validate` rejects dependencies on unknown tasks.
    pub fn strict_dependencies(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Check that the graph can be scheduled.
    ///
    /// # Errors
    /// - `Error::DanglingDependency` for the first unknown dependency, in strict mode
    /// - `Error::Cycle` listing every task Kahn's algorithm could not reach
    pub fn validate(&self) -> Result<()> {
        if let Some(&(task, missing)) = self.dangling.first() {
            if self.strict {
                return Err(Error::DanglingDependency { task, missing });
            }
            for (task, missing) in &self.dangling {
                flog_warn!(
                    "Task {} depends on unknown task {}; treating it as satisfied",
                    task,
                    missing
                );
            }
        }
        self.kahn().map(|_| ())
    }

    /// Topological layers: each wave holds tasks whose dependencies all lie
    /// in strictly earlier waves. Ids within a wave are sorted.
    pub fn waves(&self) -> Result<Vec<Vec<TaskId>>> {
        self.kahn()
    }

    /// Wave index of every task.
    pub fn wave_index(&self) -> Result<HashMap<TaskId, usize>> {
        let mut index = HashMap::new();
        for (i, wave) in self.kahn()?.into_iter().enumerate() {
            for id in wave {
                index.insert(id, i);
            }
        }
        Ok(index)
    }

    /// Wave index of one task, `None` for unknown ids.
    pub fn wave_of(&self, id: &TaskId) -> Result<Option<usize>> {
        Ok(self.wave_index()?.get(id).copied())
    }

    fn kahn(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph.neighbors_directed(n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut frontier: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut waves = Vec::new();
        let mut processed = 0;

        while !frontier.is_empty() {
            frontier.sort_by_key(|&n| self.graph[n].id);
            let mut next = Vec::new();
            for &node in &frontier {
                for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(d) = in_degree.get_mut(&dependent) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            processed += frontier.len();
            waves.push(frontier.iter().map(|&n| self.graph[n].id).collect());
            frontier = next;
        }

        if processed < self.graph.node_count() {
            let mut unreached: Vec<TaskId> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| self.graph[n].id)
                .collect();
            unreached.sort();
            return Err(Error::Cycle { unreached });
        }

        Ok(waves)
    }

    /// Pending tasks whose dependencies have all been verified.
    ///
    /// Dependencies on unknown tasks count as satisfied.
    pub fn ready(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph[n].status == TaskStatus::Pending
                    && self
                        .graph
                        .neighbors_directed(n, Direction::Incoming)
                        .all(|dep| self.graph[dep].status == TaskStatus::Verified)
            })
            .map(|n| self.graph[n].id)
            .collect();
        ready.sort();
        ready
    }

    /// First dependency of `id` that keeps it from being ready.
    pub fn blocking_dependency(&self, id: &TaskId) -> Option<&Task> {
        let &index = self.task_index.get(id)?;
        let mut blockers: Vec<&Task> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|dep| &self.graph[dep])
            .filter(|dep| dep.status != TaskStatus::Verified)
            .collect();
        blockers.sort_by_key(|t| t.id);
        blockers.into_iter().next()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.task_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Sorted task ids.
    pub fn ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.task_index.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Tasks sorted by id.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Ids of tasks currently in `status`, sorted.
    pub fn with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks()
            .into_iter()
            .filter(|t| t.status == status)
            .map(|t| t.id)
            .collect()
    }

    /// Existing dependencies of a task.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut tasks: Vec<&Task> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| &self.graph[n])
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Dependency references that point at no task.
    pub fn dangling(&self) -> &[(TaskId, TaskId)] {
        &self.dangling
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Longest dependency chain, counted in tasks (0 for an empty graph).
    pub fn depth(&self) -> Result<usize> {
        Ok(self.kahn()?.len())
    }

    /// Count of tasks per status. Every status is present, possibly as 0.
    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in self.graph.node_weights() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_finished())
    }

    pub fn any_in_flight(&self) -> bool {
        self.graph.node_weights().any(|t| t.status.is_in_flight())
    }

    /// Clone all tasks, sorted by id, e.g. for persistence.
    pub fn to_tasks(&self) -> Vec<Task> {
        self.tasks().into_iter().cloned().collect()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .field("dangling", &self.dangling.len())
            .finish()
    }
}
