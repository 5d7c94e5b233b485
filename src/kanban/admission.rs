//! Admission control for column transitions.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{
    AdmissionDecision, LimitKind, TransitionRequest, WipLimit, WorkItem, WorkflowPolicy,
};
use crate::core::ProjectId;

type ColumnKey = (ProjectId, String);
type PolicyKey = (ProjectId, String, String);

/// Outcome of an atomic WIP check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipCheck {
    /// Moved; no limit or still under it.
    Admitted { current: u32 },
    /// Moved past a soft limit.
    OverSoftLimit { current: u32, limit: u32 },
    /// Not moved; the hard limit is reached.
    Rejected { current: u32, limit: u32 },
}

/// Column occupancy per project.
///
/// Every read-decide-write runs under one mutex, so two concurrent entries
/// can never both take the last slot.
#[derive(Debug, Default)]
pub struct WipCounters {
    counts: Mutex<HashMap<ColumnKey, u32>>,
}

impl WipCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupancy(&self, project_id: &ProjectId, column: &str) -> u32 {
        self.counts
            .lock()
            .get(&(*project_id, column.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Place an item in a column without any limit check.
    pub fn enter(&self, project_id: &ProjectId, column: &str) {
        *self
            .counts
            .lock()
            .entry((*project_id, column.to_string()))
            .or_insert(0) += 1;
    }

    /// Free a slot in a column.
    pub fn release(&self, project_id: &ProjectId, column: &str) {
        if let Some(count) = self.counts.lock().get_mut(&(*project_id, column.to_string())) {
            *count = count.saturating_sub(1);
        }
    }

    /// Check the limit of `to` and, if admitted, move one slot from `from` to `to`.
    pub fn try_transfer(
        &self,
        project_id: &ProjectId,
        from: &str,
        to: &str,
        limit: Option<&WipLimit>,
    ) -> WipCheck {
        let mut counts = self.counts.lock();
        let current = counts
            .get(&(*project_id, to.to_string()))
            .copied()
            .unwrap_or(0);

        let check = match limit {
            Some(limit) if current >= limit.limit => match limit.kind {
                LimitKind::Hard => {
                    return WipCheck::Rejected {
                        current,
                        limit: limit.limit,
                    }
                }
                LimitKind::Soft => WipCheck::OverSoftLimit {
                    current,
                    limit: limit.limit,
                },
            },
            _ => WipCheck::Admitted { current },
        };

        *counts.entry((*project_id, to.to_string())).or_insert(0) += 1;
        if let Some(count) = counts.get_mut(&(*project_id, from.to_string())) {
            *count = count.saturating_sub(1);
        }
        check
    }
}

/// Decides whether work items may change columns.
#[derive(Debug, Default)]
pub struct AdmissionController {
    limits: RwLock<HashMap<ColumnKey, WipLimit>>,
    policies: RwLock<HashMap<PolicyKey, WorkflowPolicy>>,
    counters: WipCounters,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &WipCounters {
        &self.counters
    }

    pub fn set_wip_limit(&self, limit: WipLimit) {
        debug!(column = %limit.column, limit = limit.limit, kind = ?limit.kind, "WIP limit set");
        self.limits
            .write()
            .insert((limit.project_id, limit.column.clone()), limit);
    }

    pub fn remove_wip_limit(&self, project_id: &ProjectId, column: &str) -> Option<WipLimit> {
        self.limits.write().remove(&(*project_id, column.to_string()))
    }

    pub fn wip_limit(&self, project_id: &ProjectId, column: &str) -> Option<WipLimit> {
        self.limits
            .read()
            .get(&(*project_id, column.to_string()))
            .cloned()
    }

    /// Make `policy` the active one for its column pair.
    ///
    /// Returns the policy it replaced, now marked inactive.
    pub fn set_policy(&self, mut policy: WorkflowPolicy) -> Option<WorkflowPolicy> {
        policy.active = true;
        let key = (policy.project_id, policy.from.clone(), policy.to.clone());
        let previous = self.policies.write().insert(key, policy);
        previous.map(|mut old| {
            old.active = false;
            old
        })
    }

    pub fn active_policy(
        &self,
        project_id: &ProjectId,
        from: &str,
        to: &str,
    ) -> Option<WorkflowPolicy> {
        self.policies
            .read()
            .get(&(*project_id, from.to_string(), to.to_string()))
            .filter(|p| p.active)
            .cloned()
    }

    /// Decide a transition and, when admitted, account for it in the counters.
    ///
    /// `open_blockers` is the number of blocking items not yet done.
    pub fn admit(
        &self,
        request: &TransitionRequest,
        item: &WorkItem,
        open_blockers: usize,
    ) -> AdmissionDecision {
        let project = &request.project_id;
        let limit = self.wip_limit(project, &request.to);
        let limit_value = limit.as_ref().map(|l| l.limit);

        if request.from == request.to {
            return AdmissionDecision::allow(
                self.counters.occupancy(project, &request.to),
                limit_value,
            );
        }

        if let Some(policy) = self.active_policy(project, &request.from, &request.to) {
            if let Some(reason) = policy_violation(&policy, request, item, open_blockers) {
                info!(item = %request.item_id, from = %request.from, to = %request.to, %reason, "transition rejected by policy");
                return AdmissionDecision::reject(
                    reason,
                    self.counters.occupancy(project, &request.to),
                    limit_value,
                );
            }
        }

        match self
            .counters
            .try_transfer(project, &request.from, &request.to, limit.as_ref())
        {
            WipCheck::Admitted { current } => AdmissionDecision::allow(current, limit_value),
            WipCheck::OverSoftLimit { current, limit } => {
                let reason = format!(
                    "WIP soft limit exceeded for {} ({}/{})",
                    request.to,
                    current + 1,
                    limit
                );
                info!(item = %request.item_id, %reason, "transition admitted over soft limit");
                AdmissionDecision::warn(reason, current, Some(limit))
            }
            WipCheck::Rejected { current, limit } => {
                let reason = format!(
                    "WIP limit reached for {} ({}/{})",
                    request.to, current, limit
                );
                info!(item = %request.item_id, %reason, "transition rejected by WIP limit");
                AdmissionDecision::reject(reason, current, Some(limit))
            }
        }
    }
}

fn policy_violation(
    policy: &WorkflowPolicy,
    request: &TransitionRequest,
    item: &WorkItem,
    open_blockers: usize,
) -> Option<String> {
    if policy.criteria.assignee_required && item.assignee.is_none() {
        return Some(format!(
            "transition {} -> {} requires an assignee",
            request.from, request.to
        ));
    }
    if policy.criteria.no_blockers && open_blockers > 0 {
        return Some(format!(
            "transition {} -> {} blocked by {} open item(s)",
            request.from, request.to, open_blockers
        ));
    }
    if let Some(required) = policy.required_role {
        if request.actor_role != Some(required) {
            return Some(format!(
                "transition {} -> {} requires role {}",
                request.from, request.to, required
            ));
        }
    }
    None
}
