//! Kanban board admission control.
//!
//! Work items move between columns only after the `AdmissionController`
//! admits the transition: the active workflow policy for the column pair
//! must hold and the target column must have WIP room. The `KanbanBoard`
//! applies admitted moves and announces them on `story-events`.

pub mod admission;
pub mod board;

use serde::{Deserialize, Serialize};

use crate::core::uuid_id;
use crate::core::{AgentId, AgentRole, ProjectId};

pub use admission::{AdmissionController, WipCheck, WipCounters};
pub use board::KanbanBoard;

/// Standard column names.
pub mod columns {
    pub const BACKLOG: &str = "Backlog";
    pub const ANALYSIS: &str = "Analysis";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const TESTING: &str = "Testing";
    pub const DONE: &str = "Done";
}

uuid_id!(
    /// Identifier of a work item on the board.
    WorkItemId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Entry is refused at the limit.
    #[default]
    Hard,
    /// Entry is allowed at the limit with a warning.
    Soft,
}

/// Maximum number of items in one column of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipLimit {
    pub project_id: ProjectId,
    pub column: String,
    pub limit: u32,
    #[serde(default)]
    pub kind: LimitKind,
}

impl WipLimit {
    pub fn hard(project_id: ProjectId, column: &str, limit: u32) -> Self {
        Self {
            project_id,
            column: column.to_string(),
            limit,
            kind: LimitKind::Hard,
        }
    }

    pub fn soft(project_id: ProjectId, column: &str, limit: u32) -> Self {
        Self {
            kind: LimitKind::Soft,
            ..Self::hard(project_id, column, limit)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicyCriteria {
    pub assignee_required: bool,
    pub no_blockers: bool,
}

/// Conditions a transition between two columns must meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPolicy {
    pub project_id: ProjectId,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub criteria: PolicyCriteria,
    #[serde(default)]
    pub required_role: Option<AgentRole>,
    pub active: bool,
}

impl WorkflowPolicy {
    pub fn new(project_id: ProjectId, from: &str, to: &str) -> Self {
        Self {
            project_id,
            from: from.to_string(),
            to: to.to_string(),
            criteria: PolicyCriteria::default(),
            required_role: None,
            active: true,
        }
    }

    pub fn require_assignee(mut self) -> Self {
        self.criteria.assignee_required = true;
        self
    }

    pub fn require_no_blockers(mut self) -> Self {
        self.criteria.no_blockers = true;
        self
    }

    pub fn require_role(mut self, role: AgentRole) -> Self {
        self.required_role = Some(role);
        self
    }
}

/// A story or task card on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub project_id: ProjectId,
    pub title: String,
    pub column: String,
    pub assignee: Option<AgentId>,
    /// Items that must reach `Done` before this one may pass a
    /// `no_blockers` policy.
    #[serde(default)]
    pub blockers: Vec<WorkItemId>,
}

impl WorkItem {
    pub fn new(project_id: ProjectId, title: &str, column: &str) -> Self {
        Self {
            id: WorkItemId::new(),
            project_id,
            title: title.to_string(),
            column: column.to_string(),
            assignee: None,
            blockers: Vec::new(),
        }
    }

    pub fn assigned_to(mut self, agent_id: AgentId) -> Self {
        self.assignee = Some(agent_id);
        self
    }

    pub fn blocked_by(mut self, item: WorkItemId) -> Self {
        self.blockers.push(item);
        self
    }
}

/// A request to move an item between columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub project_id: ProjectId,
    pub item_id: WorkItemId,
    pub from: String,
    pub to: String,
    /// Role of whoever asks for the move, checked against `required_role`.
    pub actor_role: Option<AgentRole>,
}

/// Result of an admission check.
///
/// Rejections are ordinary outcomes and always carry a reason. An allowed
/// decision with a reason is a soft-limit warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Occupancy of the target column before this request.
    pub wip_current: u32,
    pub wip_limit: Option<u32>,
}

impl AdmissionDecision {
    pub fn allow(wip_current: u32, wip_limit: Option<u32>) -> Self {
        Self {
            allowed: true,
            reason: None,
            wip_current,
            wip_limit,
        }
    }

    pub fn warn(reason: String, wip_current: u32, wip_limit: Option<u32>) -> Self {
        Self {
            allowed: true,
            reason: Some(reason),
            wip_current,
            wip_limit,
        }
    }

    pub fn reject(reason: String, wip_current: u32, wip_limit: Option<u32>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            wip_current,
            wip_limit,
        }
    }

    pub fn is_warning(&self) -> bool {
        self.allowed && self.reason.is_some()
    }
}
