use crate::log::LogClient;
use crate::{Config, Connection, Manager};
use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Server accepts client connections and serves each on its own task.
pub struct Server {
    listener: TcpListener,
    manager: Manager,
    client: Arc<dyn LogClient>,
    config: Config,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        manager: Manager,
        client: Arc<dyn LogClient>,
        config: Config,
    ) -> Self {
        Self {
            listener,
            manager,
            client,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until `shutdown` is cancelled.
    /// Then wait up to the configured shutdown timeout for
    /// served connections to tear down before returning.
    #[tracing::instrument(level = "info", skip_all, fields(addr = ?self.listener.local_addr().ok()))]
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let tracker = TaskTracker::new();
        tracing::info!("serving client connections");

        let result = loop {
            tokio::select! {
                accept = self.listener.accept() => {
                    let (socket, addr) = match accept.context("failed to accept connection") {
                        Ok(accepted) => accepted,
                        Err(err) => break Err(err),
                    };
                    if let Err(err) = socket.set_nodelay(true) {
                        tracing::warn!(%err, ?addr, "failed to set TCP_NODELAY");
                    }

                    let connection = Connection::new(
                        self.manager.clone(),
                        self.client.clone(),
                        self.config.clone(),
                        shutdown.clone(),
                    );
                    // Errors are logged by the connection's span.
                    tracker.spawn(async move {
                        let _ = connection.serve(socket, addr).await;
                    });
                }
                () = shutdown.cancelled() => break Ok(()),
            }
        };
        tracker.close();

        tracing::info!(connections = tracker.len(), "waiting for connections to close");
        if tokio::time::timeout(self.config.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                connections = tracker.len(),
                "connections did not close before the shutdown timeout"
            );
        }

        result
    }
}
