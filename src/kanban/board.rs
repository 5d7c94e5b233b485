//! The board: work items, their columns and admitted moves.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{
    columns, AdmissionController, AdmissionDecision, TransitionRequest, WorkItem, WorkItemId,
};
use crate::broker::{publish_json, topics, Broker};
use crate::core::{AgentId, AgentRole, EventType, InboundEvent, ProjectId};
use crate::{Error, Result};

pub struct KanbanBoard {
    controller: Arc<AdmissionController>,
    items: Mutex<HashMap<WorkItemId, WorkItem>>,
    broker: Option<Arc<dyn Broker>>,
}

impl KanbanBoard {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self {
            controller,
            items: Mutex::new(HashMap::new()),
            broker: None,
        }
    }

    /// Announce admitted moves on `story-events`.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// Place an item in its column. No admission check is made.
    pub fn add_item(&self, item: WorkItem) -> WorkItemId {
        let id = item.id;
        self.controller
            .counters()
            .enter(&item.project_id, &item.column);
        self.items.lock().insert(id, item);
        id
    }

    pub fn get(&self, id: &WorkItemId) -> Option<WorkItem> {
        self.items.lock().get(id).cloned()
    }

    pub fn items_in(&self, project_id: &ProjectId, column: &str) -> Vec<WorkItem> {
        let mut items: Vec<_> = self
            .items
            .lock()
            .values()
            .filter(|i| &i.project_id == project_id && i.column == column)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.title.cmp(&b.title));
        items
    }

    pub fn assign(&self, id: &WorkItemId, agent_id: AgentId) -> Result<()> {
        let mut items = self.items.lock();
        let item = items
            .get_mut(id)
            .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))?;
        item.assignee = Some(agent_id);
        Ok(())
    }

    pub fn add_blocker(&self, id: &WorkItemId, blocker: WorkItemId) -> Result<()> {
        let mut items = self.items.lock();
        let item = items
            .get_mut(id)
            .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))?;
        if !item.blockers.contains(&blocker) {
            item.blockers.push(blocker);
        }
        Ok(())
    }

    /// Ask to move an item to `to`.
    ///
    /// Rejections are returned as decisions, not errors. An admitted move to
    /// another column is applied and then published as a `story_transition`
    /// event; a failed publish is logged and does not undo the move.
    pub async fn move_item(
        &self,
        id: &WorkItemId,
        to: &str,
        actor_role: Option<AgentRole>,
    ) -> Result<AdmissionDecision> {
        let (decision, event) = {
            let mut items = self.items.lock();
            let item = items
                .get(id)
                .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))?;
            let open_blockers = item
                .blockers
                .iter()
                .filter(|b| items.get(*b).map_or(false, |blk| blk.column != columns::DONE))
                .count();
            let request = TransitionRequest {
                project_id: item.project_id,
                item_id: item.id,
                from: item.column.clone(),
                to: to.to_string(),
                actor_role,
            };

            let decision = self.controller.admit(&request, item, open_blockers);
            if !decision.allowed || request.from == request.to {
                (decision, None)
            } else {
                let item = items
                    .get_mut(id)
                    .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))?;
                item.column = to.to_string();
                info!(item = %id, from = %request.from, to, "work item moved");
                (decision, Some(transition_event(item, &request.from)))
            }
        };

        if let (Some(event), Some(broker)) = (event, &self.broker) {
            let key = event.project_id.to_string();
            if let Err(e) =
                publish_json(broker.as_ref(), topics::STORY_EVENTS, Some(&key), &event).await
            {
                warn!(item = %id, error = %e, "story transition not published");
            }
        }
        Ok(decision)
    }
}

fn transition_event(item: &WorkItem, from: &str) -> InboundEvent {
    let event = InboundEvent::new(EventType::StoryTransition, item.project_id)
        .with_field("work_item_id", item.id.to_string())
        .with_field("title", item.title.clone())
        .with_field("from", from)
        .with_field("to", item.column.clone());
    match item.assignee {
        Some(agent_id) => event.with_field("assignee", agent_id.to_string()),
        None => event,
    }
}
