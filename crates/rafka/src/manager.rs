use crate::log::LogClient;
use crate::{Config, Consumer, Error, Identity};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Manager is the sole authority over which consumer Identities are live.
///
/// The registry of Consumers is owned by a single ManagerLoop task,
/// and Manager handles send it requests which it serves one at a time.
/// Manager is cheaply cloned.
#[derive(Clone)]
pub struct Manager {
    tx: mpsc::Sender<Request>,
}

enum Request {
    Register {
        identity: Identity,
        topic: String,
        reply: oneshot::Sender<Result<Consumer, Error>>,
    },
    Unregister {
        identity: Identity,
        reply: oneshot::Sender<()>,
    },
    Lookup {
        identity: Identity,
        reply: oneshot::Sender<Option<Consumer>>,
    },
}

/// ManagerLoop owns the registry of live Consumers, and serves Manager requests.
pub struct ManagerLoop {
    rx: mpsc::Receiver<Request>,
    client: Arc<dyn LogClient>,
    config: Config,
    shutdown: CancellationToken,
    consumers: HashMap<Identity, (Consumer, tokio::task::JoinHandle<()>)>,
    // Pumps of unregistered Consumers which may still be stopping.
    released: TaskTracker,
}

impl Manager {
    /// Build a Manager and the ManagerLoop which serves it.
    /// The loop runs until `shutdown` is cancelled or every Manager is dropped,
    /// and then stops all remaining Consumers.
    pub fn new(
        client: Arc<dyn LogClient>,
        config: Config,
        shutdown: CancellationToken,
    ) -> (Self, ManagerLoop) {
        let (tx, rx) = mpsc::channel(32);

        let manager_loop = ManagerLoop {
            rx,
            client,
            config,
            shutdown,
            consumers: HashMap::new(),
            released: TaskTracker::new(),
        };
        (Self { tx }, manager_loop)
    }

    /// Start a Consumer of `topic` which holds `identity`.
    /// Fails with Error::DuplicateIdentity if `identity` is already held.
    pub async fn register(&self, identity: Identity, topic: &str) -> Result<Consumer, Error> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Register {
            identity,
            topic: topic.to_string(),
            reply,
        })
        .await?;

        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Release `identity`, stopping its Consumer if there is one.
    pub async fn unregister(&self, identity: &Identity) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Unregister {
            identity: identity.clone(),
            reply,
        })
        .await?;

        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Find the live Consumer which holds `identity`.
    pub async fn lookup(&self, identity: &Identity) -> Result<Option<Consumer>, Error> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Lookup {
            identity: identity.clone(),
            reply,
        })
        .await?;

        rx.await.map_err(|_| Error::Shutdown)
    }

    async fn request(&self, request: Request) -> Result<(), Error> {
        self.tx.send(request).await.map_err(|_| Error::Shutdown)
    }
}

impl ManagerLoop {
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(mut self) {
        tracing::info!("consumer manager started");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,

                request = self.rx.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break, // All Managers were dropped.
                },
            }
        }
        // Requests which arrive from here on fail with Error::Shutdown.
        self.rx.close();

        self.stop_all().await;
        tracing::info!("consumer manager stopped");
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Register {
                identity,
                topic,
                reply,
            } => {
                let _ = reply.send(self.register(identity, topic));
            }
            Request::Unregister { identity, reply } => {
                self.unregister(&identity);
                let _ = reply.send(());
            }
            Request::Lookup { identity, reply } => {
                let consumer = self.consumers.get(&identity).map(|(c, _)| c.clone());
                let _ = reply.send(consumer);
            }
        }
    }

    fn register(&mut self, identity: Identity, topic: String) -> Result<Consumer, Error> {
        if self.consumers.contains_key(&identity) {
            tracing::warn!(%identity, topic, "rejected duplicate consumer registration");
            return Err(Error::DuplicateIdentity(identity));
        }

        let handle = self.client.consumer(&identity, &topic)?;
        let (consumer, task) =
            Consumer::spawn(identity.clone(), topic, handle, &self.config, &self.shutdown);

        tracing::info!(%identity, topic = consumer.topic(), "registered consumer");
        self.consumers.insert(identity, (consumer.clone(), task));

        Ok(consumer)
    }

    fn unregister(&mut self, identity: &Identity) {
        let Some((consumer, task)) = self.consumers.remove(identity) else {
            return;
        };
        // Signal the Consumer to stop, but don't wait for it here.
        consumer.close_nowait();
        self.released.spawn(async move {
            let _ = task.await;
        });

        tracing::info!(%identity, "unregistered consumer");
    }

    async fn stop_all(&mut self) {
        self.released.close();

        if self.consumers.is_empty() && self.released.is_empty() {
            return;
        }
        tracing::info!(
            count = self.consumers.len(),
            released = self.released.len(),
            "waiting for consumers to stop"
        );

        let mut tasks = Vec::with_capacity(self.consumers.len());
        for (_identity, (consumer, task)) in self.consumers.drain() {
            tasks.push((consumer, task));
        }
        // Cancellation of the shutdown token cascades to every Consumer, but
        // the loop may also be stopping because all Managers were dropped.
        for (consumer, _task) in &tasks {
            consumer.close_nowait();
        }

        let aborts: Vec<_> = tasks.iter().map(|(_, task)| task.abort_handle()).collect();
        let joined = futures::future::join(
            futures::future::join_all(tasks.into_iter().map(|(_, task)| task)),
            self.released.wait(),
        );

        if tokio::time::timeout(self.config.shutdown_timeout, joined)
            .await
            .is_err()
        {
            tracing::warn!(
                timeout = ?self.config.shutdown_timeout,
                released = self.released.len(),
                "consumers did not stop in time, aborting them"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consumer::Status;
    use crate::log::memory::MemoryLog;
    use crate::log::{ConsumerHandle, Event, LogClient, LogError, Position, ProducerHandle};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn identity(group: &str, id: &str) -> Identity {
        Identity::new(group, id).unwrap()
    }

    fn start(log: &MemoryLog) -> (Manager, CancellationToken, tokio::task::JoinHandle<()>) {
        start_with(Arc::new(log.clone()))
    }

    fn start_with(
        client: Arc<dyn LogClient>,
    ) -> (Manager, CancellationToken, tokio::task::JoinHandle<()>) {
        let shutdown = CancellationToken::new();
        let config = Config {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (manager, manager_loop) = Manager::new(client, config, shutdown.clone());
        let task = tokio::spawn(manager_loop.run());
        (manager, shutdown, task)
    }

    #[tokio::test]
    async fn duplicate_identities_are_rejected_until_released() {
        let log = MemoryLog::new();
        log.create_topic("topic", 2);
        let (manager, _shutdown, _task) = start(&log);

        let first = manager
            .register(identity("groupX", "id1"), "topic")
            .await
            .unwrap();

        let err = manager
            .register(identity("groupX", "id1"), "topic")
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::DuplicateIdentity(id) if id == first.identity()));

        // Other identities of the same group are distinct slots.
        let sibling = manager
            .register(identity("groupX", "id2"), "topic")
            .await
            .unwrap();

        first.close().await;
        manager.unregister(first.identity()).await.unwrap();

        let second = manager
            .register(identity("groupX", "id1"), "topic")
            .await
            .unwrap();
        assert_eq!(second.identity(), first.identity());

        second.close().await;
        sibling.close().await;
    }

    #[tokio::test]
    async fn lookup_and_idempotent_unregister() {
        let log = MemoryLog::new();
        log.create_topic("topic", 1);
        let (manager, _shutdown, _task) = start(&log);

        let id = identity("group", "1");
        assert!(manager.lookup(&id).await.unwrap().is_none());

        let consumer = manager.register(id.clone(), "topic").await.unwrap();
        let found = manager.lookup(&id).await.unwrap().unwrap();
        assert_eq!(found.identity(), consumer.identity());

        manager.unregister(&id).await.unwrap();
        manager.unregister(&id).await.unwrap();
        manager
            .unregister(&identity("group", "unknown"))
            .await
            .unwrap();
        assert!(manager.lookup(&id).await.unwrap().is_none());

        // Unregister signals the Consumer to stop.
        consumer.close().await;
        assert_eq!(consumer.status(), Status::Closed);
    }

    #[tokio::test]
    async fn shutdown_stops_registered_consumers() {
        let log = MemoryLog::new();
        log.create_topic("topic", 1);
        let (manager, shutdown, task) = start(&log);

        let one = manager.register(identity("g", "1"), "topic").await.unwrap();
        let two = manager.register(identity("g", "2"), "topic").await.unwrap();
        assert_eq!(log.members("g"), 2);

        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(one.status(), Status::Closed);
        assert_eq!(two.status(), Status::Closed);
        assert_eq!(log.members("g"), 0);

        assert!(matches!(
            one.consume(Duration::from_millis(10)).await,
            Err(Error::Shutdown)
        ));
        assert!(matches!(
            manager.register(identity("g", "3"), "topic").await,
            Err(Error::Shutdown)
        ));
    }

    async fn produce(log: &MemoryLog, count: usize) -> Vec<String> {
        let producer = log.producer().unwrap();
        let mut values = Vec::new();

        for i in 0..count {
            let value = format!("{i:03}");
            producer.produce("topic", None, value.as_bytes()).unwrap().await.unwrap();
            values.push(value);
        }
        values
    }

    async fn try_consume(consumer: &Consumer) -> Option<String> {
        match consumer.consume(Duration::from_millis(50)).await {
            Ok(message) => Some(String::from_utf8(message.value.to_vec()).unwrap()),
            Err(Error::Timeout) => None,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[tokio::test]
    async fn group_members_split_messages() {
        let log = MemoryLog::new();
        log.create_topic("topic", 4);
        let (manager, _shutdown, _task) = start(&log);

        let one = manager.register(identity("g", "1"), "topic").await.unwrap();
        let two = manager.register(identity("g", "2"), "topic").await.unwrap();

        // Wait for the rebalance to settle before producing.
        for _ in 0..200 {
            let (mut a, b) = (one.assignment(), two.assignment());
            a.extend(b);
            a.sort();
            if a == vec![0, 1, 2, 3] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let expect = produce(&log, 20).await;

        let (mut got_one, mut got_two) = (Vec::new(), Vec::new());
        for _ in 0..200 {
            if got_one.len() + got_two.len() == expect.len() {
                break;
            }
            got_one.extend(try_consume(&one).await);
            got_two.extend(try_consume(&two).await);
        }
        assert!(!got_one.is_empty() && !got_two.is_empty());

        let mut all: Vec<_> = got_one.into_iter().chain(got_two).collect();
        all.sort();
        assert_eq!(all, expect);
    }

    #[tokio::test]
    async fn restarted_members_resume_with_bounded_redelivery() {
        let log = MemoryLog::new();
        log.create_topic("topic", 1);
        let (manager, _shutdown, _task) = start(&log);
        let expect = produce(&log, 10).await;

        let id = identity("g", "1");
        let first = manager.register(id.clone(), "topic").await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 5 {
            seen.extend(try_consume(&first).await);
        }
        first.close().await;
        manager.unregister(&id).await.unwrap();

        let second = manager.register(id.clone(), "topic").await.unwrap();
        for _ in 0..100 {
            let mut distinct = seen.clone();
            distinct.sort();
            distinct.dedup();
            if distinct == expect {
                break;
            }
            seen.extend(try_consume(&second).await);
        }

        let mut distinct = seen.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct, expect);

        // Only the delivered and unacknowledged message is re-read.
        assert_eq!(seen.len() - expect.len(), 1, "{seen:?}");
    }

    #[tokio::test]
    async fn departing_members_hand_off_with_bounded_redelivery() {
        let log = MemoryLog::new();
        log.create_topic("topic", 4);
        let (manager, _shutdown, _task) = start(&log);

        let one = manager.register(identity("g", "1"), "topic").await.unwrap();
        let two = manager.register(identity("g", "2"), "topic").await.unwrap();

        for _ in 0..200 {
            if one.assignment().len() == 2 && two.assignment().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let expect = produce(&log, 40).await;

        // Both members consume, until the second departs mid-stream.
        let mut seen = Vec::new();
        while seen.len() < 12 {
            seen.extend(try_consume(&one).await);
            seen.extend(try_consume(&two).await);
        }
        two.close().await;
        manager.unregister(two.identity()).await.unwrap();

        for _ in 0..400 {
            let mut distinct = seen.clone();
            distinct.sort();
            distinct.dedup();
            if distinct == expect {
                break;
            }
            seen.extend(try_consume(&one).await);
        }
        assert_eq!(one.assignment(), vec![0, 1, 2, 3]);

        let mut distinct = seen.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct, expect);

        // Redelivery is bounded by the partitions plus the read-ahead slot.
        let duplicates = seen.len() - expect.len();
        assert!(duplicates <= 4 + 2, "{duplicates} duplicates: {seen:?}");
    }

    // LogClient whose consumers take a while to leave their group.
    struct SlowLeave(MemoryLog);

    struct SlowLeaveHandle(Box<dyn ConsumerHandle>);

    impl LogClient for SlowLeave {
        fn consumer(
            &self,
            identity: &Identity,
            topic: &str,
        ) -> Result<Box<dyn ConsumerHandle>, LogError> {
            Ok(Box::new(SlowLeaveHandle(self.0.consumer(identity, topic)?)))
        }

        fn producer(&self) -> Result<Box<dyn ProducerHandle>, LogError> {
            self.0.producer()
        }
    }

    #[async_trait::async_trait]
    impl ConsumerHandle for SlowLeaveHandle {
        async fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, LogError> {
            self.0.poll(timeout).await
        }
        async fn commit(&mut self, offsets: &[Position]) -> Result<(), LogError> {
            self.0.commit(offsets).await
        }
        fn assignment(&self) -> Result<Vec<i32>, LogError> {
            self.0.assignment()
        }
        async fn close(self: Box<Self>) {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.close().await;
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_unregistered_consumers() {
        let log = MemoryLog::new();
        log.create_topic("topic", 1);
        let (manager, shutdown, task) = start_with(Arc::new(SlowLeave(log.clone())));

        let consumer = manager.register(identity("g", "1"), "topic").await.unwrap();
        manager.unregister(consumer.identity()).await.unwrap();
        assert_eq!(log.members("g"), 1);

        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(consumer.status(), Status::Closed);
        assert_eq!(log.members("g"), 0);
    }

    #[tokio::test]
    async fn dropping_all_managers_stops_the_loop() {
        let log = MemoryLog::new();
        log.create_topic("topic", 1);
        let (manager, _shutdown, task) = start(&log);

        let consumer = manager.register(identity("g", "1"), "topic").await.unwrap();
        drop(manager);
        task.await.unwrap();

        assert_eq!(consumer.status(), Status::Closed);
    }
}
