use crate::log::{ConsumerHandle, Event, LogError, Message, Position};
use crate::{Config, Error, Identity};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Lifecycle status of a Consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Created,
    Running,
    /// Close was requested, and the Consumer is committing and releasing its handle.
    Draining,
    Closed,
    /// The Consumer's log handle failed unrecoverably.
    Dead(String),
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Closed | Status::Dead(_))
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    status: Status,
    assignment: Vec<i32>,
}

// A request for the next message, answered by the pump.
type Fetch = oneshot::Sender<Message>;

/// Consumer is a member of a consumer group, subscribed to a single topic.
///
/// Each Consumer runs a pump task which exclusively owns its log handle.
/// The pump reads ahead by at most one message, which it holds until a caller
/// of `consume()` takes it. A delivered message is acknowledged by the
/// caller's next `consume()`, and acknowledged offsets are committed by the
/// pump periodically, upon rebalances, and on close.
///
/// Consumer is cheaply cloned, and all clones refer to the same member.
#[derive(Clone)]
pub struct Consumer(Arc<ConsumerInner>);

struct ConsumerInner {
    identity: Identity,
    topic: String,
    fetch_tx: mpsc::Sender<Fetch>,
    stop: CancellationToken,
    snapshot: watch::Receiver<Snapshot>,
}

impl Consumer {
    /// Start a Consumer which pumps events from `handle`.
    /// The Consumer stops when `shutdown` is cancelled or it's closed.
    /// Returned is the Consumer and its pump task.
    pub fn spawn(
        identity: Identity,
        topic: String,
        handle: Box<dyn ConsumerHandle>,
        config: &Config,
        shutdown: &CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let stop = shutdown.child_token();
        let (fetch_tx, fetch_rx) = mpsc::channel(1);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
            status: Status::Created,
            assignment: Vec::new(),
        });

        let pump = Pump {
            identity: identity.clone(),
            topic: topic.clone(),
            handle,
            fetch_rx,
            stop: stop.clone(),
            snapshot: snapshot_tx,
            poll_interval: config.poll_interval,
            commit_interval: config.commit_interval,
            slot: None,
            waiter: None,
            delivered: None,
            pending: BTreeMap::new(),
            last_commit: std::time::Instant::now(),
        };
        let task = tokio::spawn(pump.run());

        let consumer = Self(Arc::new(ConsumerInner {
            identity,
            topic,
            fetch_tx,
            stop,
            snapshot: snapshot_rx,
        }));
        (consumer, task)
    }

    pub fn identity(&self) -> &Identity {
        &self.0.identity
    }

    pub fn topic(&self) -> &str {
        &self.0.topic
    }

    pub fn status(&self) -> Status {
        self.0.snapshot.borrow().status.clone()
    }

    /// Partitions most recently assigned to this Consumer.
    pub fn assignment(&self) -> Vec<i32> {
        self.0.snapshot.borrow().assignment.clone()
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// A message which isn't returned due to the timeout remains
    /// available to a following call.
    pub async fn consume(&self, timeout: Duration) -> Result<Message, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (fetch, mut rx) = oneshot::channel();

        match tokio::time::timeout_at(deadline, self.0.fetch_tx.send(fetch)).await {
            Err(_elapsed) => return Err(Error::Timeout),
            Ok(Err(_closed)) => return Err(self.terminal_error()),
            Ok(Ok(())) => {}
        }

        tokio::select! {
            result = &mut rx => result.map_err(|_| self.terminal_error()),
            () = tokio::time::sleep_until(deadline) => {
                // After close(), a concurrent send by the pump has either already
                // completed and is returned here, or fails and is retained by the pump.
                rx.close();
                rx.try_recv().map_err(|_| Error::Timeout)
            }
        }
    }

    /// Stop the Consumer and wait for it to commit and release its log handle.
    /// Closing an already-closed Consumer is a no-op.
    pub async fn close(&self) {
        self.0.stop.cancel();

        let mut snapshot = self.0.snapshot.clone();
        // An Err means the pump exited without a final status (it was aborted).
        let _ = snapshot.wait_for(|s| s.status.is_terminal()).await;
    }

    /// Signal the Consumer to stop, without waiting for it.
    pub fn close_nowait(&self) {
        self.0.stop.cancel();
    }

    fn terminal_error(&self) -> Error {
        match &self.0.snapshot.borrow().status {
            Status::Dead(reason) => Error::SessionDead(reason.clone()),
            _ => Error::Shutdown,
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("identity", &self.0.identity)
            .field("topic", &self.0.topic)
            .field("status", &self.status())
            .finish()
    }
}

enum Exit {
    Stopped,
    Dead(LogError),
}

struct Pump {
    identity: Identity,
    topic: String,
    handle: Box<dyn ConsumerHandle>,
    fetch_rx: mpsc::Receiver<Fetch>,
    stop: CancellationToken,
    snapshot: watch::Sender<Snapshot>,
    poll_interval: Duration,
    commit_interval: Duration,

    // Message read from the log and not yet delivered.
    slot: Option<Message>,
    // Caller waiting for a message.
    waiter: Option<Fetch>,
    // Position of the last delivered message, which is not yet acknowledged.
    delivered: Option<Position>,
    // Acknowledged offsets which are not yet committed, by partition.
    pending: BTreeMap<i32, i64>,
    last_commit: std::time::Instant,
}

impl Pump {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(consumer = %self.identity, topic = %self.topic),
    )]
    async fn run(mut self) {
        metrics::gauge!("rafka_consumers").increment(1.0);
        self.set_status(Status::Running);
        tracing::info!("consumer started");

        let exit = loop {
            let waiting = self.waiter.is_some();
            let full = self.slot.is_some();

            tokio::select! {
                biased;

                () = self.stop.cancelled() => break Exit::Stopped,

                () = waiter_closed(&mut self.waiter), if waiting => {
                    // The caller gave up.
                    self.waiter = None;
                }
                fetch = self.fetch_rx.recv(), if !waiting => match fetch {
                    Some(fetch) => self.on_fetch(fetch).await,
                    None => break Exit::Stopped, // All Consumer handles were dropped.
                },
                event = self.handle.poll(self.poll_interval), if !full => match event {
                    Ok(Some(Event::Message(message))) => {
                        tracing::trace!(partition = message.partition, offset = message.offset, "read message");
                        self.slot = Some(message);
                    }
                    Ok(Some(Event::Assignment(partitions))) => self.on_assignment(partitions).await,
                    Ok(None) => self.maybe_commit().await,
                    Err(err) => break Exit::Dead(err),
                },
            }

            self.try_deliver();
        };

        let status = match exit {
            Exit::Stopped => {
                self.set_status(Status::Draining);
                // The last delivered message is not acknowledged, and is not committed.
                self.commit().await;
                Status::Closed
            }
            Exit::Dead(err) => {
                tracing::error!(%err, "consumer failed");
                self.commit().await;
                Status::Dead(err.to_string())
            }
        };

        let Self {
            handle,
            snapshot,
            fetch_rx,
            waiter,
            ..
        } = self;
        handle.close().await;

        metrics::gauge!("rafka_consumers").decrement(1.0);
        tracing::info!(?status, "consumer stopped");

        // Publish the final status before waiting callers observe the pump's exit.
        snapshot.send_modify(|s| s.status = status);
        drop((fetch_rx, waiter));
    }

    async fn on_fetch(&mut self, fetch: Fetch) {
        // A new fetch acknowledges the previously delivered message.
        if let Some(Position { partition, offset }) = self.delivered.take() {
            self.pending.insert(partition, offset + 1);
            self.maybe_commit().await;
        }
        self.waiter = Some(fetch);
    }

    async fn on_assignment(&mut self, partitions: Vec<i32>) {
        tracing::info!(?partitions, "partition assignment changed");
        metrics::counter!("rafka_rebalances").increment(1);

        // Progress through revoked partitions now belongs to their new owners,
        // which re-read from the last committed offset.
        self.pending.retain(|p, _| partitions.contains(p));

        if let Some(delivered) = &self.delivered {
            if !partitions.contains(&delivered.partition) {
                tracing::debug!(
                    partition = delivered.partition,
                    offset = delivered.offset,
                    "dropping acknowledgement of a revoked partition"
                );
                self.delivered = None;
            }
        }

        if let Some(message) = &self.slot {
            if !partitions.contains(&message.partition) {
                tracing::debug!(
                    partition = message.partition,
                    offset = message.offset,
                    "discarding read-ahead message of a revoked partition"
                );
                self.slot = None;
            }
        }
        self.snapshot.send_modify(|s| s.assignment = partitions);

        self.commit().await;
    }

    fn try_deliver(&mut self) {
        match (self.waiter.take(), self.slot.take()) {
            (Some(waiter), Some(message)) => {
                let position = message.position();

                match waiter.send(message) {
                    Ok(()) => {
                        metrics::counter!("rafka_messages_consumed").increment(1);
                        self.delivered = Some(position);
                    }
                    // The caller timed out concurrently. Retain the message for the next one.
                    Err(message) => self.slot = Some(message),
                }
            }
            (waiter, slot) => {
                self.waiter = waiter;
                self.slot = slot;
            }
        }
    }

    async fn maybe_commit(&mut self) {
        if self.last_commit.elapsed() >= self.commit_interval {
            self.commit().await;
        }
    }

    async fn commit(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        // A rebalance may have revoked partitions which the pump hasn't yet observed.
        match self.handle.assignment() {
            Ok(assigned) => self.pending.retain(|p, _| assigned.contains(p)),
            Err(err) => {
                tracing::warn!(%err, "failed to read assignment before committing");
                return;
            }
        }
        if self.pending.is_empty() {
            return;
        }
        let offsets: Vec<Position> = self
            .pending
            .iter()
            .map(|(partition, offset)| Position {
                partition: *partition,
                offset: *offset,
            })
            .collect();

        match self.handle.commit(&offsets).await {
            Ok(()) => {
                tracing::debug!(?offsets, "committed offsets");
                metrics::counter!("rafka_offset_commits").increment(1);
                self.pending.clear();
                self.last_commit = std::time::Instant::now();
            }
            Err(err) => {
                // Offsets remain pending, and are retried by the next commit.
                tracing::warn!(%err, ?offsets, "failed to commit offsets");
            }
        }
    }

    fn set_status(&self, status: Status) {
        self.snapshot.send_modify(|s| s.status = status);
    }
}

// Resolves when the caller of a pending fetch stops waiting for it.
async fn waiter_closed(waiter: &mut Option<Fetch>) {
    match waiter {
        Some(fetch) => fetch.closed().await,
        None => std::future::pending().await,
    }
}
