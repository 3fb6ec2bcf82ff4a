mod cli;
mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use qbatch::{BatchConfig, BatchConsumer, InMemoryBroker};

use crate::cli::CliArgs;
use crate::demo::{spawn_producer, LoggingBatchProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let args = CliArgs::parse();

    let config = if args.config.exists() {
        BatchConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        BatchConfig::new("orders")
    };
    info!(
        destination = %config.destination,
        consumers = config.consumer_count,
        completion_size = config.completion_size,
        "configuration loaded"
    );

    let broker = InMemoryBroker::new();
    let producer = spawn_producer(
        broker.clone(),
        config.destination.clone(),
        args.messages,
        Duration::from_millis(args.produce_interval_ms),
    );

    let mut consumer = BatchConsumer::builder(config)
        .connection_factory(Arc::new(broker.clone()))
        .processor(Arc::new(LoggingBatchProcessor::new(args.fail_every)))
        .scheduler(tokio::runtime::Handle::current())
        .build()
        .context("invalid consumer configuration")?;
    consumer.start().context("failed to start consumer")?;

    if args.run_for_secs > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.run_for_secs)) => {
                info!(seconds = args.run_for_secs, "run time elapsed");
            }
            _ = shutdown_signal() => {}
        }
    } else {
        shutdown_signal().await;
    }

    producer.abort();
    let consumer = tokio::task::spawn_blocking(move || {
        consumer.stop();
        consumer
    })
    .await
    .context("consumer shutdown task failed")?;

    info!(
        stats = %consumer.stats(),
        commits = broker.commit_count(),
        rollbacks = broker.rollback_count(),
        left_in_queue = broker.depth(consumer.destination()),
        "shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
