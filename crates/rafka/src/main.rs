use anyhow::Context;
use clap::Parser;
use rafka::config::KafkaConfig;
use rafka::log::{kafka::KafkaClient, memory::MemoryLog, LogClient};
use rafka::{Config, Manager, Server};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// A Redis-protocol front end for producing to and consuming from Kafka.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Address to listen on for client connections.
    #[arg(long, default_value = "0.0.0.0:6380", env = "RAFKA_LISTEN")]
    listen: String,
    /// Log which clients produce to and consume from.
    #[arg(long = "log", value_enum, default_value_t = LogKind::Kafka, env = "RAFKA_LOG")]
    log_kind: LogKind,
    /// librdkafka configuration JSON `FILE`. Required for the kafka log.
    #[arg(long = "kafka", env = "RAFKA_KAFKA_CONFIG")]
    kafka_config: Option<PathBuf>,
    /// Partitions of topics which the memory log creates on first produce.
    #[arg(long, default_value = "4", env = "RAFKA_MEMORY_PARTITIONS")]
    memory_partitions: usize,

    /// Timeout of a CONSUME which doesn't give one.
    #[arg(long, default_value = "5s", env = "RAFKA_CONSUME_TIMEOUT", value_parser = humantime::parse_duration)]
    consume_timeout: Duration,
    /// Timeout of a FLUSH which doesn't give one.
    #[arg(long, default_value = "5s", env = "RAFKA_FLUSH_TIMEOUT", value_parser = humantime::parse_duration)]
    flush_timeout: Duration,
    /// Largest timeout which a client may request.
    #[arg(long, default_value = "1h", env = "RAFKA_MAX_BLOCK_TIMEOUT", value_parser = humantime::parse_duration)]
    max_block_timeout: Duration,
    /// Minimum interval between offset commits of a consumer.
    #[arg(long, default_value = "5s", env = "RAFKA_COMMIT_INTERVAL", value_parser = humantime::parse_duration)]
    commit_interval: Duration,
    /// Timeout of each internal poll of the log by a consumer.
    #[arg(long, default_value = "100ms", env = "RAFKA_POLL_INTERVAL", value_parser = humantime::parse_duration)]
    poll_interval: Duration,
    /// Time allowed for connections and consumers to stop upon shutdown.
    #[arg(long, default_value = "5s", env = "RAFKA_SHUTDOWN_TIMEOUT", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    /// Address on which to serve Prometheus metrics, if any.
    #[arg(long, env = "RAFKA_METRICS_LISTEN")]
    metrics_listen: Option<std::net::SocketAddr>,
    /// Emit logs as JSON.
    #[arg(long, env = "RAFKA_LOG_JSON")]
    log_json: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
enum LogKind {
    Kafka,
    Memory,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if cli.log_json {
        tracing_subscriber::fmt::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Some(addr) = cli.metrics_listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install prometheus exporter")?;
        tracing::info!(%addr, "serving prometheus metrics");
    }

    let client: Arc<dyn LogClient> = match cli.log_kind {
        LogKind::Kafka => {
            let path = cli
                .kafka_config
                .as_deref()
                .context("--kafka configuration is required with --log=kafka")?;
            Arc::new(KafkaClient::new(KafkaConfig::load(path)?))
        }
        LogKind::Memory => Arc::new(MemoryLog::with_auto_create(cli.memory_partitions)),
    };

    let config = Config {
        consume_timeout: cli.consume_timeout,
        flush_timeout: cli.flush_timeout,
        max_block_timeout: cli.max_block_timeout,
        commit_interval: cli.commit_interval,
        poll_interval: cli.poll_interval,
        shutdown_timeout: cli.shutdown_timeout,
    };
    tracing::info!(?config, log = ?cli.log_kind, "starting rafka");

    // Connections are stopped before the Manager, so that they tear down their own sessions.
    let manager_shutdown = CancellationToken::new();
    let server_shutdown = CancellationToken::new();

    let (manager, manager_loop) = Manager::new(client.clone(), config.clone(), manager_shutdown.clone());
    let manager_task = tokio::spawn(manager_loop.run());

    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    let server = Server::new(listener, manager, client, config);
    let mut server_task = tokio::spawn(server.serve(server_shutdown.clone()));

    let signaled = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to listen for SIGTERM")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
            _ = sigterm.recv() => {}
        }
        anyhow::Ok(())
    };

    let server_result = tokio::select! {
        signaled = signaled => {
            signaled?;
            tracing::info!("received shutdown signal");
            server_shutdown.cancel();
            (&mut server_task).await
        }
        result = &mut server_task => result,
    };
    // The server may have stopped on its own due to an error.
    server_shutdown.cancel();

    tracing::info!("stopping consumer manager");
    manager_shutdown.cancel();
    manager_task.await.context("consumer manager panicked")?;

    server_result.context("server panicked")??;
    tracing::info!("bye!");

    Ok(())
}
