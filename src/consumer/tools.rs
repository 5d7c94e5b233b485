//! What a task handler can do on behalf of its agent.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::conversation::{
    Artifact, ArtifactId, ArtifactStore, ConversationLog, ConversationRecord, RecordId, RecordKind,
};
use crate::core::{AgentId, ProjectId, RoutedTask, TaskId};
use crate::Result;

/// Tools bound to one agent and the task it is running.
///
/// Writes made for a task carry idempotency keys derived from the task id,
/// so a handler that runs the same task again (a redelivery after a restart)
/// finds its earlier records instead of adding new ones. Records are keyed by
/// the order they are written in; artifacts by name.
#[derive(Clone)]
pub struct AgentToolContext {
    agent_id: AgentId,
    project_id: ProjectId,
    task_id: Option<TaskId>,
    /// Records written so far for `task_id`.
    written: Arc<AtomicU32>,
    conversations: Arc<dyn ConversationLog>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl AgentToolContext {
    pub fn new(
        agent_id: AgentId,
        project_id: ProjectId,
        conversations: Arc<dyn ConversationLog>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            agent_id,
            project_id,
            task_id: None,
            written: Arc::new(AtomicU32::new(0)),
            conversations,
            artifacts,
        }
    }

    /// The same tools scoped to `task`.
    pub fn for_task(&self, task: &RoutedTask) -> Self {
        Self {
            task_id: Some(task.task_id),
            written: Arc::new(AtomicU32::new(0)),
            ..self.clone()
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    /// Post a message to the project conversation.
    pub async fn send_message(&self, content: &str) -> Result<RecordId> {
        self.record(RecordKind::AgentMessage, content).await
    }

    /// Ask the user a question.
    pub async fn ask_question(&self, question: &str) -> Result<RecordId> {
        self.record(RecordKind::Question, question).await
    }

    pub async fn create_artifact(&self, name: &str, kind: &str, content: &str) -> Result<ArtifactId> {
        let artifact = Artifact {
            id: ArtifactId::new(),
            project_id: self.project_id,
            agent_id: self.agent_id,
            task_id: self.task_id,
            name: name.to_string(),
            kind: kind.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            idempotency_key: self
                .task_id
                .map(|task_id| format!("{}:artifact:{}", task_id, name)),
        };
        let id = self.artifacts.store(artifact).await?;
        debug!(agent_id = %self.agent_id, artifact = %id, name, kind, "artifact created");
        Ok(id)
    }

    async fn record(&self, kind: RecordKind, content: &str) -> Result<RecordId> {
        let mut record = ConversationRecord::new(self.project_id, self.agent_id, kind, content);
        if let Some(task_id) = self.task_id {
            let n = self.written.fetch_add(1, Ordering::SeqCst);
            record = record
                .for_task(task_id)
                .with_idempotency_key(format!("{}:{}:{}", task_id, kind, n));
        }
        self.conversations.record(record).await
    }
}
