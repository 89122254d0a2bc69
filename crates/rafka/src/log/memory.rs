use super::{
    ConsumerHandle, Delivery, Event, LogClient, LogError, Message, Position, ProducerHandle,
};
use bytes::Bytes;
use futures::FutureExt;
use std::collections::{hash_map::Entry, BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// MemoryLog is an in-process log with topics, partitions, consumer groups,
/// and committed offsets. Group membership changes rebalance immediately:
/// partition `p` of a topic is assigned to the `p % N`'th of the N members
/// subscribed to it, ordered by join order.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    // Notified on every change of topics or group membership.
    changed: Notify,
    // Partitions of topics which are created on first produce, if enabled.
    auto_create: Option<usize>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Record>>>,
    groups: HashMap<String, Group>,
    // Topics whose consumers fail with a fatal error.
    failed: HashMap<String, String>,
    next_member: u64,
    next_partition: usize,
}

struct Record {
    key: Option<Bytes>,
    value: Bytes,
}

#[derive(Default)]
struct Group {
    // Members of the group and their subscribed topic, in join order.
    members: BTreeMap<u64, String>,
    committed: HashMap<(String, i32), i64>,
}

impl State {
    fn assignment(&self, group: &str, topic: &str, member: u64) -> Vec<i32> {
        let Some(group) = self.groups.get(group) else {
            return Vec::new();
        };
        let members: Vec<u64> = group
            .members
            .iter()
            .filter(|(_, subscribed)| subscribed.as_str() == topic)
            .map(|(member, _)| *member)
            .collect();

        let Some(index) = members.iter().position(|m| *m == member) else {
            return Vec::new();
        };
        let partitions = self.topics.get(topic).map(Vec::len).unwrap_or_default();

        (0..partitions)
            .filter(|p| p % members.len() == index)
            .map(|p| p as i32)
            .collect()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    /// Build a MemoryLog where producing to a missing topic fails.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Build a MemoryLog which creates missing topics with `partitions` on first produce.
    pub fn with_auto_create(partitions: usize) -> Self {
        Self::build(Some(partitions.max(1)))
    }

    fn build(auto_create: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                auto_create,
            }),
        }
    }

    /// Create `topic` with `partitions`, if it doesn't already exist.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| (0..partitions.max(1)).map(|_| Vec::new()).collect());
        }
        self.inner.changed.notify_waiters();
    }

    /// Values of all messages of `topic`, ordered by partition and then offset.
    pub fn values(&self, topic: &str) -> Vec<Bytes> {
        let state = self.inner.state.lock().unwrap();

        state
            .topics
            .get(topic)
            .into_iter()
            .flatten()
            .flatten()
            .map(|record| record.value.clone())
            .collect()
    }

    /// Committed offset of a `group` for a `topic` partition.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.inner.state.lock().unwrap();

        state
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)))
            .copied()
    }

    /// Number of current members of `group`.
    pub fn members(&self, group: &str) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.groups.get(group).map(|g| g.members.len()).unwrap_or_default()
    }

    /// Cause all current and future consumers of `topic` to fail with a fatal error.
    pub fn fail_consumers(&self, topic: &str, reason: &str) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.failed.insert(topic.to_string(), reason.to_string());
        }
        self.inner.changed.notify_waiters();
    }
}

impl LogClient for MemoryLog {
    fn consumer(
        &self,
        identity: &crate::Identity,
        topic: &str,
    ) -> Result<Box<dyn ConsumerHandle>, LogError> {
        let member = {
            let mut state = self.inner.state.lock().unwrap();
            state.next_member += 1;
            let member = state.next_member;

            state
                .groups
                .entry(identity.group.clone())
                .or_default()
                .members
                .insert(member, topic.to_string());

            member
        };
        self.inner.changed.notify_waiters();

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            group: identity.group.clone(),
            topic: topic.to_string(),
            member,
            assignment: Vec::new(),
            positions: HashMap::new(),
            cursor: 0,
        }))
    }

    fn producer(&self) -> Result<Box<dyn ProducerHandle>, LogError> {
        Ok(Box::new(MemoryProducer {
            inner: self.inner.clone(),
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    group: String,
    topic: String,
    member: u64,
    // Last assignment reported through an Event.
    assignment: Vec<i32>,
    // Next offset to read of each assigned partition.
    positions: HashMap<i32, i64>,
    // Index into `assignment` of the next partition to read.
    cursor: usize,
}

impl MemoryConsumer {
    fn step(&mut self, state: &State) -> Option<Result<Event, LogError>> {
        if let Some(reason) = state.failed.get(&self.topic) {
            return Some(Err(LogError::Fatal(reason.clone())));
        }

        let assignment = state.assignment(&self.group, &self.topic, self.member);

        if assignment != self.assignment {
            let committed = state.groups.get(&self.group).map(|g| &g.committed);

            self.positions.retain(|p, _| assignment.contains(p));
            for partition in &assignment {
                let key = (self.topic.clone(), *partition);
                self.positions.entry(*partition).or_insert_with(|| {
                    committed
                        .and_then(|c| c.get(&key))
                        .copied()
                        .unwrap_or_default()
                });
            }
            self.assignment = assignment.clone();
            self.cursor = 0;

            return Some(Ok(Event::Assignment(assignment)));
        }

        let partitions = state.topics.get(&self.topic)?;

        for step in 0..self.assignment.len() {
            let index = (self.cursor + step) % self.assignment.len();
            let partition = self.assignment[index];
            let position = self.positions.entry(partition).or_default();

            let Some(record) = partitions
                .get(partition as usize)
                .and_then(|records| records.get(*position as usize))
            else {
                continue;
            };

            let message = Message {
                topic: self.topic.clone(),
                partition,
                offset: *position,
                key: record.key.clone(),
                value: record.value.clone(),
            };
            *position += 1;
            self.cursor = index + 1;

            return Some(Ok(Event::Message(message)));
        }
        None
    }
}

#[async_trait::async_trait]
impl ConsumerHandle for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, LogError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let inner = self.inner.clone();

        loop {
            // Register for notification before examining state, so that a
            // change made after the examination isn't missed.
            let changed = inner.changed.notified();

            {
                let state = inner.state.lock().unwrap();
                if let Some(result) = self.step(&state) {
                    return result.map(Some);
                }
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, offsets: &[Position]) -> Result<(), LogError> {
        let mut state = self.inner.state.lock().unwrap();
        let group = state.groups.entry(self.group.clone()).or_default();

        for Position { partition, offset } in offsets {
            group
                .committed
                .insert((self.topic.clone(), *partition), *offset);
        }
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<i32>, LogError> {
        let state = self.inner.state.lock().unwrap();
        Ok(state.assignment(&self.group, &self.topic, self.member))
    }

    async fn close(self: Box<Self>) {
        // Group membership is released on drop.
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            if let Some(group) = state.groups.get_mut(&self.group) {
                group.members.remove(&self.member);
            }
        }
        self.inner.changed.notify_waiters();
    }
}

struct MemoryProducer {
    inner: Arc<Inner>,
}

#[async_trait::async_trait]
impl ProducerHandle for MemoryProducer {
    fn produce(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> Result<Delivery, LogError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            let state = &mut *state;

            let partitions = match state.topics.entry(topic.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let Some(partitions) = self.inner.auto_create else {
                        // Like Kafka, a missing topic is discovered only upon delivery.
                        let err = LogError::UnknownTopic(topic.to_string());
                        return Ok(futures::future::ready(Err(err)).boxed());
                    };
                    entry.insert((0..partitions).map(|_| Vec::new()).collect())
                }
            };

            let partition = match key {
                Some(key) => xxhash_rust::xxh3::xxh3_64(key) as usize % partitions.len(),
                None => {
                    state.next_partition = state.next_partition.wrapping_add(1);
                    state.next_partition % partitions.len()
                }
            };

            partitions[partition].push(Record {
                key: key.map(Bytes::copy_from_slice),
                value: Bytes::copy_from_slice(value),
            });
        }
        self.inner.changed.notify_waiters();

        Ok(futures::future::ready(Ok(())).boxed())
    }

    async fn ping(&self) -> Result<String, LogError> {
        let state = self.inner.state.lock().unwrap();
        Ok(format!("memory log with {} topics", state.topics.len()))
    }
}
