use super::{
    ConsumerHandle, Delivery, Event, LogClient, LogError, Message, Position, ProducerHandle,
};
use crate::config::KafkaConfig;
use bytes::Bytes;
use futures::FutureExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// LogClient backed by librdkafka.
pub struct KafkaClient {
    config: KafkaConfig,
}

impl KafkaClient {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

fn client_config(properties: BTreeMap<String, String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        config.set(key, value);
    }
    config
}

impl LogClient for KafkaClient {
    fn consumer(
        &self,
        identity: &crate::Identity,
        topic: &str,
    ) -> Result<Box<dyn ConsumerHandle>, LogError> {
        let mut config = client_config(self.config.consumer_properties());
        config
            .set("group.id", &identity.group)
            .set("client.id", identity.to_string())
            // Offsets are committed only by the consumer pump.
            .set("enable.auto.commit", "false");

        let consumer: Arc<StreamConsumer> = Arc::new(config.create()?);
        consumer.subscribe(&[topic])?;

        tracing::debug!(%identity, topic, "created kafka consumer");

        Ok(Box::new(KafkaConsumer {
            consumer,
            topic: topic.to_string(),
            assignment: Vec::new(),
            stashed: None,
        }))
    }

    fn producer(&self) -> Result<Box<dyn ProducerHandle>, LogError> {
        let producer: FutureProducer = client_config(self.config.producer_properties()).create()?;
        Ok(Box::new(KafkaProducer { producer }))
    }
}

struct KafkaConsumer {
    // Shared with blocking tasks which commit offsets.
    consumer: Arc<StreamConsumer>,
    topic: String,
    // Last assignment reported through an Event.
    assignment: Vec<i32>,
    // Message received concurrently with a rebalance, which is
    // held back until the new assignment has been reported.
    stashed: Option<Message>,
}

impl KafkaConsumer {
    fn assignment_event(&mut self) -> Result<Option<Event>, LogError> {
        let current = ConsumerHandle::assignment(self)?;

        if current == self.assignment {
            return Ok(None);
        }
        self.assignment = current.clone();
        Ok(Some(Event::Assignment(current)))
    }
}

#[async_trait::async_trait]
impl ConsumerHandle for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, LogError> {
        if let Some(event) = self.assignment_event()? {
            return Ok(Some(event));
        }
        if let Some(message) = self.stashed.take() {
            return Ok(Some(Event::Message(message)));
        }

        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_elapsed) => return Ok(None),
            Ok(Ok(borrowed)) => to_message(&borrowed),
            Ok(Err(KafkaError::PartitionEOF(_))) => return Ok(None),
            Ok(Err(err @ KafkaError::MessageConsumptionFatal(_))) => {
                return Err(LogError::Fatal(err.to_string()))
            }
            Ok(Err(err)) if err.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) => {
                return Err(LogError::Fatal(err.to_string()))
            }
            Ok(Err(err)) => {
                tracing::warn!(%err, topic = self.topic, "retrying transient consumer error");
                return Ok(None);
            }
        };

        if let Some(event) = self.assignment_event()? {
            self.stashed = Some(message);
            return Ok(Some(event));
        }
        Ok(Some(Event::Message(message)))
    }

    async fn commit(&mut self, offsets: &[Position]) -> Result<(), LogError> {
        let mut list = TopicPartitionList::with_capacity(offsets.len());
        for Position { partition, offset } in offsets {
            list.add_partition_offset(&self.topic, *partition, Offset::Offset(*offset))?;
        }

        // A synchronous commit blocks for a broker round-trip.
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|err| LogError::Fatal(err.to_string()))??;

        Ok(())
    }

    fn assignment(&self) -> Result<Vec<i32>, LogError> {
        let mut partitions: Vec<i32> = self
            .consumer
            .assignment()?
            .elements_for_topic(&self.topic)
            .iter()
            .map(|elem| elem.partition())
            .collect();

        partitions.sort_unstable();
        partitions.dedup();
        Ok(partitions)
    }

    async fn close(self: Box<Self>) {
        let Self {
            consumer, topic, ..
        } = *self;
        consumer.unsubscribe();

        // Dropping the consumer blocks while it leaves its group.
        if let Err(err) = tokio::task::spawn_blocking(move || drop(consumer)).await {
            tracing::warn!(%err, topic, "failed to close kafka consumer");
        }
    }
}

fn to_message<M: rdkafka::Message>(message: &M) -> Message {
    Message {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    }
}

struct KafkaProducer {
    producer: FutureProducer,
}

#[async_trait::async_trait]
impl ProducerHandle for KafkaProducer {
    fn produce(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> Result<Delivery, LogError> {
        let record = FutureRecord::<[u8], [u8]>::to(topic).payload(value);
        let record = match key {
            Some(key) => record.key(key),
            None => record,
        };

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                return Err(LogError::QueueFull)
            }
            Err((err, _)) => return Err(err.into()),
        };
        let topic = topic.to_string();

        Ok(async move {
            match delivery.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((
                    KafkaError::MessageProduction(
                        RDKafkaErrorCode::UnknownTopic | RDKafkaErrorCode::UnknownTopicOrPartition,
                    ),
                    _,
                ))) => Err(LogError::UnknownTopic(topic)),
                Ok(Err((err, _))) => Err(err.into()),
                Err(_canceled) => Err(LogError::Closed),
            }
        }
        .boxed())
    }

    async fn ping(&self) -> Result<String, LogError> {
        let producer = self.producer.clone();

        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Duration::from_secs(5))
        })
        .await
        .map_err(|err| LogError::Fatal(err.to_string()))??;

        Ok(format!(
            "{} brokers, {} topics",
            metadata.brokers().len(),
            metadata.topics().len()
        ))
    }
}
