//! Implementation plans and their dependency graph.
//!
//! A plan is produced once per task and never mutated afterwards. The
//! `PlanGraph` mirrors the plan's explicit `depends_on` edges in a petgraph
//! `DiGraph` so the scheduler can walk steps in dependency order.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a step within its plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a step does to its target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    #[default]
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepAction::Create => write!(f, "create"),
            StepAction::Modify => write!(f, "modify"),
            StepAction::Delete => write!(f, "delete"),
        }
    }
}

/// One file-level unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationStep {
    pub id: StepId,
    /// Position in the original plan.
    pub order: u32,
    pub file_path: String,
    #[serde(default)]
    pub action: StepAction,
    /// Steps that must finish before this one starts.
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub description: String,
}

impl ImplementationStep {
    pub fn new(id: &str, order: u32, file_path: &str) -> Self {
        Self {
            id: StepId::from(id),
            order,
            file_path: file_path.to_string(),
            action: StepAction::Create,
            depends_on: Vec::new(),
            description: String::new(),
        }
    }

    pub fn with_action(mut self, action: StepAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn depends_on(mut self, step: &str) -> Self {
        self.depends_on.push(StepId::from(step));
        self
    }
}

/// An ordered list of steps produced for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImplementationPlan {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub steps: Vec<ImplementationStep>,
}

impl ImplementationPlan {
    pub fn new(steps: Vec<ImplementationStep>) -> Self {
        Self {
            task_id: None,
            steps,
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Parse a plan from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &StepId) -> Option<&ImplementationStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Steps sorted by their `order` index.
    pub fn ordered_steps(&self) -> Vec<&ImplementationStep> {
        let mut steps: Vec<_> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }

    /// Check ids are unique, dependencies exist and there is no cycle.
    pub fn validate(&self) -> Result<()> {
        PlanGraph::build(self).map(|_| ())
    }
}

/// The dependency graph of a plan.
///
/// Edges point from a dependency to the step that needs it.
pub struct PlanGraph {
    graph: DiGraph<StepId, ()>,
    step_index: HashMap<StepId, NodeIndex>,
}

impl PlanGraph {
    /// Build the graph, rejecting duplicate ids, unknown dependencies and cycles.
    pub fn build(plan: &ImplementationPlan) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut step_index = HashMap::new();

        for step in &plan.steps {
            if step_index.contains_key(&step.id) {
                return Err(Error::Validation(format!(
                    "Duplicate step id {} in plan",
                    step.id
                )));
            }
            let index = graph.add_node(step.id.clone());
            step_index.insert(step.id.clone(), index);
        }

        for step in &plan.steps {
            let to = step_index[&step.id];
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(Error::Validation(format!(
                        "Step {} depends on itself",
                        step.id
                    )));
                }
                let from = step_index.get(dep).ok_or_else(|| {
                    Error::Validation(format!(
                        "Step {} depends on unknown step {}",
                        step.id, dep
                    ))
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(Error::Validation(
                "Plan dependencies contain a cycle".to_string(),
            ));
        }

        Ok(Self { graph, step_index })
    }

    pub fn step_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Steps the given step depends on.
    pub fn dependencies(&self, id: &StepId) -> Vec<&StepId> {
        match self.step_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Steps that depend on the given step.
    pub fn dependents(&self, id: &StepId) -> Vec<&StepId> {
        match self.step_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Steps in an order where every dependency comes first.
    pub fn topological_order(&self) -> Result<Vec<&StepId>> {
        toposort(&self.graph, None)
            .map(|order| {
                order
                    .into_iter()
                    .filter_map(|index| self.graph.node_weight(index))
                    .collect()
            })
            .map_err(|_| Error::Validation("Plan dependencies contain a cycle".to_string()))
    }
}

impl std::fmt::Debug for PlanGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanGraph")
            .field("steps", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
