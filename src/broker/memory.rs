//! In-process broker with partitioned topics and consumer groups.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{topics, Broker, Delivery, Message, Subscription};
use crate::{Error, Result};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: u32 = 8;

type PartitionKey = (String, u32);

/// Retained messages of one partition. Offsets below `base` were compacted away.
#[derive(Default)]
struct PartitionLog {
    base: u64,
    entries: Vec<Message>,
}

impl PartitionLog {
    fn next_offset(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Message> {
        let index = offset.checked_sub(self.base)?;
        self.entries.get(index as usize)
    }
}

struct TopicLog {
    partitions: Vec<PartitionLog>,
    next_round_robin: u32,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    /// group -> (topic, partition) -> next offset to consume
    committed: HashMap<String, HashMap<PartitionKey, u64>>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Bumped on every append or close so blocked receivers re-poll.
    changes: watch::Sender<u64>,
}

/// Broker that keeps every topic partition as an append-only log in memory.
///
/// Logs are retained until [`MemoryBroker::compact`] drops what every
/// consumer group has committed; nothing is dropped on its own, so a
/// long-running broker should compact periodically.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Create a broker with all standard topics, each with `partitions` partitions.
    pub fn new(partitions: u32) -> Self {
        let (changes, _) = watch::channel(0);
        let broker = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changes,
            }),
        };
        for topic in topics::ALL {
            broker.create_topic(topic, partitions);
        }
        broker
    }

    /// Create a topic if it does not exist yet.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        let partitions = partitions.max(1);
        let mut state = self.shared.state.lock();
        state.topics.entry(name.to_string()).or_insert_with(|| TopicLog {
            partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
            next_round_robin: 0,
        });
    }

    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        let state = self.shared.state.lock();
        state.topics.get(topic).map(|t| t.partitions.len() as u32)
    }

    /// Snapshot of every retained message on a topic, ordered by partition then offset.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)
            .map(|t| {
                t.partitions
                    .iter()
                    .flat_map(|p| p.entries.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop messages every known consumer group has committed.
    ///
    /// A group that never committed on a partition holds it at offset 0.
    /// Returns the number of messages dropped. Offsets are not reused, and a
    /// group joining later starts at the oldest retained message.
    pub fn compact(&self) -> usize {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.committed.is_empty() {
            return 0;
        }
        let mut dropped = 0;
        for (topic, log) in state.topics.iter_mut() {
            for (partition, plog) in log.partitions.iter_mut().enumerate() {
                let key = (topic.clone(), partition as u32);
                let low = state
                    .committed
                    .values()
                    .map(|offsets| offsets.get(&key).copied().unwrap_or(0))
                    .min()
                    .unwrap_or(0);
                if low <= plog.base {
                    continue;
                }
                let count = ((low - plog.base) as usize).min(plog.entries.len());
                plog.entries.drain(..count);
                plog.base += count as u64;
                dropped += count;
            }
        }
        if dropped > 0 {
            debug!(dropped, "memory broker compacted");
        }
        dropped
    }

    /// Next offset `group` will consume from a partition.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> u64 {
        let state = self.shared.state.lock();
        state
            .committed
            .get(group)
            .and_then(|offsets| offsets.get(&(topic.to_string(), partition)))
            .copied()
            .unwrap_or(0)
    }

    /// Stop accepting publishes and wake every subscriber with `BrokerClosed`.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.notify();
        debug!("memory broker closed");
    }

    fn notify(&self) {
        self.shared.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

/// Stable partition for a key (FNV-1a).
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> Result<Delivery> {
        let delivery = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::BrokerClosed);
            }
            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
            let count = log.partitions.len() as u32;
            let partition = match key {
                Some(key) => partition_for(key, count),
                None => {
                    let p = log.next_round_robin % count;
                    log.next_round_robin = log.next_round_robin.wrapping_add(1);
                    p
                }
            };
            let plog = &mut log.partitions[partition as usize];
            let offset = plog.next_offset();
            plog.entries.push(Message {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.map(str::to_string),
                payload,
                timestamp: Utc::now(),
            });
            Delivery { partition, offset }
        };
        self.notify();
        trace!(
            topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "published"
        );
        Ok(delivery)
    }

    async fn subscribe(&self, topics: &[&str], group: &str) -> Result<Box<dyn Subscription>> {
        let mut state = self.shared.state.lock();
        let mut assignments = Vec::new();
        for topic in topics {
            let log = state
                .topics
                .get(*topic)
                .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
            for partition in 0..log.partitions.len() as u32 {
                assignments.push((topic.to_string(), partition));
            }
        }

        let committed = state.committed.entry(group.to_string()).or_default();
        let positions = assignments
            .iter()
            .map(|key| (key.clone(), committed.get(key).copied().unwrap_or(0)))
            .collect();

        debug!(group, topics = ?topics, "subscribed");
        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            changes: self.shared.changes.subscribe(),
            group: group.to_string(),
            assignments,
            positions,
            cursor: 0,
        }))
    }
}

/// A group member reading every partition of its topics.
pub struct MemorySubscription {
    shared: Arc<Shared>,
    changes: watch::Receiver<u64>,
    group: String,
    assignments: Vec<PartitionKey>,
    /// Next offset to fetch per partition.
    positions: HashMap<PartitionKey, u64>,
    /// Partition to try first on the next poll, so one busy partition
    /// cannot starve the others.
    cursor: usize,
}

impl MemorySubscription {
    fn poll(&mut self) -> Result<Option<Message>> {
        let state = self.shared.state.lock();
        if state.closed {
            return Err(Error::BrokerClosed);
        }

        let count = self.assignments.len();
        for i in 0..count {
            let idx = (self.cursor + i) % count;
            let key = &self.assignments[idx];
            let Some(plog) = state
                .topics
                .get(&key.0)
                .and_then(|t| t.partitions.get(key.1 as usize))
            else {
                continue;
            };
            let position = self
                .positions
                .get(key)
                .copied()
                .unwrap_or(0)
                .max(plog.base);
            if let Some(message) = plog.get(position) {
                let message = message.clone();
                self.positions.insert(key.clone(), position + 1);
                self.cursor = (idx + 1) % count;
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Message> {
        loop {
            // Mark the current version seen before scanning so an append
            // racing with the scan still wakes us.
            let _ = self.changes.borrow_and_update();
            if let Some(message) = self.poll()? {
                return Ok(message);
            }
            if self.changes.changed().await.is_err() {
                return Err(Error::BrokerClosed);
            }
        }
    }

    async fn commit(&mut self, message: &Message) -> Result<()> {
        let key = (message.topic.clone(), message.partition);
        if !self.positions.contains_key(&key) {
            return Err(Error::Validation(format!(
                "group {} is not assigned {}/{}",
                self.group, message.topic, message.partition
            )));
        }
        let mut state = self.shared.state.lock();
        let offsets = state.committed.entry(self.group.clone()).or_default();
        let next = offsets.entry(key).or_insert(0);
        *next = (*next).max(message.offset + 1);
        Ok(())
    }

    async fn seek_to_committed(&mut self) -> Result<()> {
        let state = self.shared.state.lock();
        let committed = state.committed.get(&self.group);
        for (key, position) in self.positions.iter_mut() {
            *position = committed
                .and_then(|offsets| offsets.get(key))
                .copied()
                .unwrap_or(0);
        }
        Ok(())
    }
}
