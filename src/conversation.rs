//! Conversation log and artifact store used by agents while running tasks.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::uuid_id;
use crate::core::{AgentId, ProjectId, TaskId};
use crate::Result;

uuid_id!(
    /// Identifier of a conversation record.
    RecordId
);

uuid_id!(
    /// Identifier of a stored artifact.
    ArtifactId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    UserMessage,
    AgentMessage,
    Question,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::UserMessage => write!(f, "user_message"),
            RecordKind::AgentMessage => write!(f, "agent_message"),
            RecordKind::Question => write!(f, "question"),
        }
    }
}

/// One entry in a project's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: RecordId,
    pub project_id: ProjectId,
    pub agent_id: AgentId,
    pub task_id: Option<TaskId>,
    pub kind: RecordKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Records with the same key are stored once.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ConversationRecord {
    pub fn new(project_id: ProjectId, agent_id: AgentId, kind: RecordKind, content: &str) -> Self {
        Self {
            id: RecordId::new(),
            project_id,
            agent_id,
            task_id: None,
            kind,
            content: content.to_string(),
            created_at: Utc::now(),
            idempotency_key: None,
        }
    }

    /// Tie the record to a task. User messages become unique per task.
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        if self.kind == RecordKind::UserMessage {
            self.idempotency_key = Some(format!("{}:{}", task_id, self.kind));
        }
        self
    }

    pub fn with_idempotency_key(mut self, key: String) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// Store a record and return its id.
    ///
    /// When a record with the same idempotency key exists, nothing is stored
    /// and the existing id is returned.
    async fn record(&self, record: ConversationRecord) -> Result<RecordId>;

    async fn records_for_project(&self, project_id: &ProjectId) -> Vec<ConversationRecord>;

    async fn records_for_task(&self, task_id: &TaskId) -> Vec<ConversationRecord>;

    /// Whether some consumer already finished handling the task.
    async fn is_processed(&self, task_id: &TaskId) -> bool;

    /// Remember that the task was handled, whatever the outcome.
    async fn mark_processed(&self, task_id: TaskId) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryConversationLog {
    records: RwLock<Vec<ConversationRecord>>,
    processed: RwLock<HashSet<TaskId>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn record(&self, record: ConversationRecord) -> Result<RecordId> {
        let mut records = self.records.write().await;
        if let Some(key) = &record.idempotency_key {
            if let Some(existing) = records
                .iter()
                .find(|r| r.idempotency_key.as_ref() == Some(key))
            {
                return Ok(existing.id);
            }
        }
        let id = record.id;
        records.push(record);
        Ok(id)
    }

    async fn records_for_project(&self, project_id: &ProjectId) -> Vec<ConversationRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| &r.project_id == project_id)
            .cloned()
            .collect()
    }

    async fn records_for_task(&self, task_id: &TaskId) -> Vec<ConversationRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.task_id.as_ref() == Some(task_id))
            .cloned()
            .collect()
    }

    async fn is_processed(&self, task_id: &TaskId) -> bool {
        self.processed.read().await.contains(task_id)
    }

    async fn mark_processed(&self, task_id: TaskId) -> Result<()> {
        self.processed.write().await.insert(task_id);
        Ok(())
    }
}

/// A document produced by an agent (requirements, code, test report, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub project_id: ProjectId,
    pub agent_id: AgentId,
    pub task_id: Option<TaskId>,
    pub name: String,
    pub kind: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Artifacts with the same key are stored once.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact and return its id.
    ///
    /// When an artifact with the same idempotency key exists, nothing is
    /// stored and the existing id is returned.
    async fn store(&self, artifact: Artifact) -> Result<ArtifactId>;

    async fn get(&self, id: &ArtifactId) -> Option<Artifact>;

    async fn artifacts_for_project(&self, project_id: &ProjectId) -> Vec<Artifact>;
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    artifacts: RwLock<HashMap<ArtifactId, Artifact>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn store(&self, artifact: Artifact) -> Result<ArtifactId> {
        let mut artifacts = self.artifacts.write().await;
        if let Some(key) = &artifact.idempotency_key {
            if let Some(existing) = artifacts
                .values()
                .find(|a| a.idempotency_key.as_ref() == Some(key))
            {
                return Ok(existing.id);
            }
        }
        let id = artifact.id;
        artifacts.insert(id, artifact);
        Ok(id)
    }

    async fn get(&self, id: &ArtifactId) -> Option<Artifact> {
        self.artifacts.read().await.get(id).cloned()
    }

    async fn artifacts_for_project(&self, project_id: &ProjectId) -> Vec<Artifact> {
        let mut found: Vec<_> = self
            .artifacts
            .read()
            .await
            .values()
            .filter(|a| &a.project_id == project_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.created_at);
        found
    }
}
