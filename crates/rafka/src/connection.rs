use crate::command::{Binding, Command};
use crate::log::{LogClient, Message};
use crate::resp::{Frame, ProtocolError, RespCodec};
use crate::{Config, Consumer, Error, Identity, Manager, Producer};
use anyhow::Context;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Connection serves the commands of a single client.
///
/// A Connection binds to at most one Consumer, registered with the Manager
/// by its first consume, and at most one Producer, created by its first produce.
/// Both are released when the Connection ends, however it ends.
pub struct Connection {
    manager: Manager,
    client: Arc<dyn LogClient>,
    config: Config,
    shutdown: CancellationToken,
    // Identity set by CLIENT SETNAME.
    name: Option<Identity>,
    consumer: Option<Consumer>,
    producer: Option<Producer>,
}

enum Flow {
    Continue,
    Close,
}

impl Connection {
    pub fn new(
        manager: Manager,
        client: Arc<dyn LogClient>,
        config: Config,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            client,
            config,
            shutdown,
            name: None,
            consumer: None,
            producer: None,
        }
    }

    /// Serve the client of `socket` until it disconnects or quits,
    /// or until shutdown is signaled.
    #[tracing::instrument(
        level = "info",
        ret,
        err(Debug, level = "warn"),
        skip(self, socket),
        fields(?addr)
    )]
    pub async fn serve<S>(mut self, socket: S, addr: std::net::SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!("accepted client connection");
        metrics::gauge!("rafka_connections").increment(1);

        let mut framed = Framed::new(socket, RespCodec::default());
        let result = self.serve_frames(&mut framed).await;

        self.teardown().await;
        metrics::gauge!("rafka_connections").decrement(1);

        result
    }

    async fn serve_frames<S>(&mut self, framed: &mut Framed<S, RespCodec>) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                () = self.shutdown.cancelled() => return Ok(()),
            };

            let frame = match frame {
                None => return Ok(()), // Client closed the connection.
                Some(Ok(frame)) => frame,
                Some(Err(ProtocolError::Io(err))) => {
                    return Err(err).context("failed to read from client")
                }
                Some(Err(err)) => {
                    let _ = framed.send(Frame::error("ERR", format!("Protocol error: {err}"))).await;
                    return Err(err).context("client sent a malformed frame");
                }
            };

            let (reply, flow) = match Command::parse(frame) {
                Ok(command) => {
                    tracing::trace!(?command, "dispatching command");
                    self.dispatch(command).await
                }
                Err(err) => (Frame::error("ERR", err), Flow::Continue),
            };
            framed
                .send(reply)
                .await
                .context("failed to write to client")?;

            if let Flow::Close = flow {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> (Frame, Flow) {
        let result = match command {
            Command::Ping(message) => self.ping(message).await,
            Command::Produce { topic, key, value } => self
                .produce(&topic, key.as_deref(), &value)
                .map(|()| Frame::ok()),
            Command::Flush(timeout) => self.flush(timeout).await.map(|()| Frame::ok()),
            Command::Consume { bind, timeout } => {
                let timeout = self
                    .config
                    .client_timeout(timeout, self.config.consume_timeout);
                self.consume(bind, timeout).await
            }
            Command::SetName(identity) => {
                self.name = Some(identity);
                Ok(Frame::ok())
            }
            Command::GetName => Ok(match &self.name {
                Some(name) => Frame::bulk(name.to_string()),
                None => Frame::Null,
            }),
            Command::Blpop { topic, timeout } => {
                let timeout = self
                    .config
                    .client_timeout(Some(timeout), self.config.consume_timeout);
                self.blpop(topic, timeout).await
            }
            Command::Quit => return (Frame::ok(), Flow::Close),
        };

        match result {
            Ok(reply) => (reply, Flow::Continue),
            Err(Error::Shutdown) => (Frame::error("SHUTDOWN", Error::Shutdown), Flow::Close),
            Err(err) => {
                tracing::debug!(%err, "command failed");
                (Frame::error(err.code(), &err), Flow::Continue)
            }
        }
    }

    async fn ping(&mut self, message: Option<Bytes>) -> Result<Frame, Error> {
        // A bound producer is also probed.
        if let Some(producer) = &mut self.producer {
            let description = producer.ping().await?;
            tracing::debug!(%description, "pinged log");
        }
        Ok(match message {
            Some(message) => Frame::Bulk(message),
            None => Frame::Simple("PONG".to_string()),
        })
    }

    fn produce(&mut self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> Result<(), Error> {
        let producer = match self.producer.take() {
            Some(producer) => producer,
            None => {
                let handle = self.client.producer()?;
                tracing::debug!("created producer");
                Producer::new(handle, self.shutdown.clone())
            }
        };
        self.producer.insert(producer).produce(topic, key, value)
    }

    async fn flush(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let Some(producer) = &mut self.producer else {
            return Ok(()); // Nothing was produced.
        };
        let timeout = self.config.client_timeout(timeout, self.config.flush_timeout);

        producer.flush(timeout).await
    }

    async fn blpop(&mut self, topic: String, timeout: Duration) -> Result<Frame, Error> {
        let Some(identity) = self.name.clone() else {
            return Err(Error::Binding(
                "BLPOP requires a consumer identity (use CLIENT SETNAME <group>:<id>)".to_string(),
            ));
        };
        self.consume(Some(Binding { identity, topic }), timeout).await
    }

    async fn consume(&mut self, bind: Option<Binding>, timeout: Duration) -> Result<Frame, Error> {
        let consumer = self.bind(bind).await?;

        let result = tokio::select! {
            result = consumer.consume(timeout) => result,
            () = self.shutdown.cancelled() => Err(Error::Shutdown),
        };

        match result {
            Ok(message) => Ok(message_frame(message)),
            Err(Error::Timeout) => Ok(Frame::NullArray),
            Err(err @ Error::SessionDead(_)) => {
                // Release the dead session, so that the client may bind anew.
                self.release_consumer().await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    // Resolve the Consumer of this connection, registering it if `bind` is the first binding.
    async fn bind(&mut self, bind: Option<Binding>) -> Result<Consumer, Error> {
        match (&self.consumer, bind) {
            (Some(consumer), None) => Ok(consumer.clone()),
            (Some(consumer), Some(Binding { identity, topic }))
                if consumer.identity() == &identity && consumer.topic() == topic =>
            {
                Ok(consumer.clone())
            }
            (Some(consumer), Some(_)) => Err(Error::Binding(format!(
                "connection is already bound to consumer {} of topic '{}'",
                consumer.identity(),
                consumer.topic(),
            ))),
            (None, None) => Err(Error::Binding(
                "connection is not bound to a consumer (use CONSUME <topic> <group> <id>)"
                    .to_string(),
            )),
            (None, Some(Binding { identity, topic })) => {
                let consumer = self.manager.register(identity, &topic).await?;
                self.consumer = Some(consumer.clone());
                Ok(consumer)
            }
        }
    }

    async fn teardown(&mut self) {
        self.release_consumer().await;

        if let Some(producer) = self.producer.take() {
            if producer.outstanding() != 0 {
                tracing::warn!(
                    outstanding = producer.outstanding(),
                    "releasing producer with unflushed messages"
                );
            }
        }
    }

    // Close the bound Consumer, if any, and release its identity.
    async fn release_consumer(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        consumer.close().await;

        if let Err(err) = self.manager.unregister(consumer.identity()).await {
            tracing::debug!(%err, identity = %consumer.identity(), "failed to unregister consumer");
        }
    }
}

fn message_frame(message: Message) -> Frame {
    let Message {
        topic,
        partition,
        offset,
        key: _,
        value,
    } = message;

    Frame::Array(vec![
        Frame::bulk(topic),
        Frame::Integer(partition as i64),
        Frame::Integer(offset),
        Frame::Bulk(value),
    ])
}
