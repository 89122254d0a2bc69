use crate::log::{Delivery, LogError, ProducerHandle};
use crate::Error;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Producer enqueues messages to the log without waiting for them,
/// and offers `flush()` as a barrier over all prior enqueued messages.
///
/// Individual delivery outcomes aren't reported. Rather, the first
/// failed delivery since the last `flush()` is returned by the next one.
pub struct Producer {
    handle: Box<dyn ProducerHandle>,
    pending: FuturesUnordered<Delivery>,
    first_error: Option<LogError>,
    shutdown: CancellationToken,
}

impl Producer {
    pub fn new(handle: Box<dyn ProducerHandle>, shutdown: CancellationToken) -> Self {
        Self {
            handle,
            pending: FuturesUnordered::new(),
            first_error: None,
            shutdown,
        }
    }

    /// Enqueue a message. Only a local rejection of the message is returned here.
    pub fn produce(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(), Error> {
        self.reap();

        let delivery = self
            .handle
            .produce(topic, key, value)
            .map_err(Error::LocalEnqueueFailure)?;
        self.pending.push(delivery);

        metrics::counter!("rafka_messages_produced").increment(1);
        Ok(())
    }

    /// Wait up to `timeout` for all enqueued messages to be delivered.
    ///
    /// On success, every message previously passed to `produce()` was
    /// acknowledged by the log. Otherwise the first delivery error is returned.
    /// Deliveries which are still outstanding after a timeout remain pending.
    pub async fn flush(&mut self, timeout: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;

        while !self.pending.is_empty() {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return Err(Error::Shutdown),

                Some(result) = self.pending.next() => self.on_delivery(result),

                () = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(outstanding = self.pending.len(), "flush timed out");
                    return Err(Error::Timeout);
                }
            }
        }

        match self.first_error.take() {
            Some(err) => Err(Error::ProduceFailure(err)),
            None => Ok(()),
        }
    }

    /// Probe liveness of the log.
    pub async fn ping(&mut self) -> Result<String, Error> {
        Ok(self.handle.ping().await?)
    }

    /// Number of enqueued messages which are not yet known to be delivered.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    // Collect outcomes of deliveries which have already resolved.
    fn reap(&mut self) {
        while let Some(Some(result)) = self.pending.next().now_or_never() {
            self.on_delivery(result);
        }
    }

    fn on_delivery(&mut self, result: Result<(), LogError>) {
        let Err(err) = result else {
            return;
        };
        metrics::counter!("rafka_produce_failures").increment(1);

        if self.first_error.is_none() {
            tracing::debug!(%err, "message delivery failed");
            self.first_error = Some(err);
        } else {
            tracing::debug!(%err, "additional message delivery failed");
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("outstanding", &self.pending.len())
            .field("first_error", &self.first_error)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log::memory::MemoryLog;
    use crate::log::LogClient;
    use pretty_assertions::assert_eq;

    fn producer(log: &MemoryLog) -> Producer {
        Producer::new(log.producer().unwrap(), CancellationToken::new())
    }

    #[tokio::test]
    async fn flush_waits_for_every_delivery() {
        let log = MemoryLog::new();
        log.create_topic("topic", 3);
        let mut producer = producer(&log);

        for value in ["0", "1", "2"] {
            producer.produce("topic", None, value.as_bytes()).unwrap();
        }
        producer.flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(producer.outstanding(), 0);

        let mut values = log.values("topic");
        values.sort();
        assert_eq!(values, vec!["0", "1", "2"]);

        // A flush with nothing outstanding succeeds immediately.
        producer.flush(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn flush_returns_the_first_delivery_error_once() {
        let log = MemoryLog::new();
        log.create_topic("topic", 1);
        let mut producer = producer(&log);

        // Enqueue is accepted: the failure is only learned on flush.
        producer.produce("missing-1", None, b"a").unwrap();
        producer.produce("topic", None, b"b").unwrap();
        producer.produce("missing-2", None, b"c").unwrap();

        let err = producer.flush(Duration::from_secs(5)).await.unwrap_err();
        assert!(
            matches!(&err, Error::ProduceFailure(LogError::UnknownTopic(t)) if t == "missing-1"),
            "{err:?}"
        );
        assert_eq!(log.values("topic"), vec!["b"]);

        // The error was reported, and isn't reported again.
        producer.flush(Duration::from_secs(5)).await.unwrap();
    }

    struct Stub {
        delivery: fn() -> Result<Delivery, LogError>,
    }

    #[async_trait::async_trait]
    impl ProducerHandle for Stub {
        fn produce(&self, _: &str, _: Option<&[u8]>, _: &[u8]) -> Result<Delivery, LogError> {
            (self.delivery)()
        }
        async fn ping(&self) -> Result<String, LogError> {
            Ok("stub".to_string())
        }
    }

    #[tokio::test]
    async fn local_rejections_fail_produce() {
        let mut producer = Producer::new(
            Box::new(Stub {
                delivery: || Err(LogError::QueueFull),
            }),
            CancellationToken::new(),
        );

        assert!(matches!(
            producer.produce("topic", None, b"value"),
            Err(Error::LocalEnqueueFailure(LogError::QueueFull))
        ));
        assert_eq!(producer.outstanding(), 0);
        assert_eq!(producer.ping().await.unwrap(), "stub");
    }

    #[tokio::test]
    async fn flush_times_out_and_is_interrupted_by_shutdown() {
        let shutdown = CancellationToken::new();
        let mut producer = Producer::new(
            Box::new(Stub {
                delivery: || Ok(futures::future::pending().boxed()),
            }),
            shutdown.clone(),
        );
        producer.produce("topic", Some(b"key"), b"value").unwrap();

        assert!(matches!(
            producer.flush(Duration::from_millis(50)).await,
            Err(Error::Timeout)
        ));
        assert_eq!(producer.outstanding(), 1);

        shutdown.cancel();
        assert!(matches!(
            producer.flush(Duration::from_secs(30)).await,
            Err(Error::Shutdown)
        ));
    }
}
