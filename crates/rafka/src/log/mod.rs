//! Interfaces of the partitioned log which rafka fronts.
//!
//! `kafka` implements them with librdkafka, and `memory` with an
//! in-process log which is used for local development and tests.

use bytes::Bytes;
use futures::future::BoxFuture;
use std::time::Duration;

pub mod kafka;
pub mod memory;

/// A message read from a partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl Message {
    pub fn position(&self) -> Position {
        Position {
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Position of a message within its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub partition: i32,
    pub offset: i64,
}

/// Event observed by polling a ConsumerHandle.
#[derive(Debug, PartialEq)]
pub enum Event {
    Message(Message),
    /// The set of partitions assigned to this member changed.
    /// The new, sorted assignment is attached.
    Assignment(Vec<i32>),
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
    #[error("local produce queue is full")]
    QueueFull,
    #[error("fatal log client error: {0}")]
    Fatal(String),
    #[error("log client is closed")]
    Closed,
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Resolves when the log acknowledges or rejects a produced message.
pub type Delivery = BoxFuture<'static, Result<(), LogError>>;

/// LogClient builds consumer and producer handles of a log.
pub trait LogClient: Send + Sync + 'static {
    /// Build a consumer which joins `identity.group` as member `identity.id`
    /// and subscribes to `topic`.
    fn consumer(
        &self,
        identity: &crate::Identity,
        topic: &str,
    ) -> Result<Box<dyn ConsumerHandle>, LogError>;

    /// Build a new producer.
    fn producer(&self) -> Result<Box<dyn ProducerHandle>, LogError>;
}

#[async_trait::async_trait]
pub trait ConsumerHandle: Send {
    /// Poll for the next Event, waiting up to `timeout`.
    /// Returns Ok(None) if no event occurred.
    /// Transient errors are retried by the implementation:
    /// an Err is unrecoverable, and the handle must not be polled again.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, LogError>;

    /// Commit the next offsets to read for the given partitions of the subscribed topic.
    /// Resolves once the commit is durable.
    async fn commit(&mut self, offsets: &[Position]) -> Result<(), LogError>;

    /// Partitions of the subscribed topic which are currently assigned to this member.
    fn assignment(&self) -> Result<Vec<i32>, LogError>;

    /// Leave the consumer group and release the handle.
    async fn close(self: Box<Self>);
}

#[async_trait::async_trait]
pub trait ProducerHandle: Send + Sync {
    /// Enqueue a message for delivery, without waiting for it to be acknowledged.
    /// An Err means the message was rejected before being enqueued.
    fn produce(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> Result<Delivery, LogError>;

    /// Probe liveness of the log, returning a short description of it.
    async fn ping(&self) -> Result<String, LogError>;
}
