//! Partitioned publish/subscribe broker.
//!
//! The router and the agent consumers only see the `Broker` and
//! `Subscription` traits. Delivery is at-least-once: a message stays
//! uncommitted until the subscriber commits it, and a subscriber that
//! rewinds (or a new subscription in the same group) sees uncommitted
//! messages again. Messages sharing a key land on the same partition and
//! are delivered in publish order.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

pub use memory::MemoryBroker;

/// Topic names.
pub mod topics {
    pub const USER_MESSAGES: &str = "user-messages";
    pub const AGENT_RESPONSES: &str = "agent-responses";
    pub const APPROVAL_RESPONSES: &str = "approval-responses";
    pub const AGENT_STATUS: &str = "agent-status";
    /// Routed tasks, keyed by target agent id.
    pub const AGENT_TASKS: &str = "agent-tasks";
    /// Admitted board transitions, keyed by project id.
    pub const STORY_EVENTS: &str = "story-events";

    /// Topics the event router consumes.
    pub const ROUTER_INPUTS: [&str; 5] = [
        USER_MESSAGES,
        AGENT_RESPONSES,
        APPROVAL_RESPONSES,
        AGENT_STATUS,
        STORY_EVENTS,
    ];

    pub const ALL: [&str; 6] = [
        USER_MESSAGES,
        AGENT_RESPONSES,
        APPROVAL_RESPONSES,
        AGENT_STATUS,
        AGENT_TASKS,
        STORY_EVENTS,
    ];
}

/// A message read from a topic partition.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Where a published message was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message. Messages with the same key keep their relative order.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> Result<Delivery>;

    /// Join `group` on the given topics, resuming from the group's committed offsets.
    async fn subscribe(&self, topics: &[&str], group: &str) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message. Cancel-safe.
    async fn recv(&mut self) -> Result<Message>;

    /// Mark the message and everything before it in its partition as consumed.
    async fn commit(&mut self, message: &Message) -> Result<()>;

    /// Rewind every partition to the group's last committed offset.
    async fn seek_to_committed(&mut self) -> Result<()>;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    broker: &dyn Broker,
    topic: &str,
    key: Option<&str>,
    value: &T,
) -> Result<Delivery> {
    let payload = serde_json::to_vec(value).map_err(|e| Error::Publish {
        topic: topic.to_string(),
        reason: e.to_string(),
    })?;
    broker.publish(topic, key, payload).await
}
