//! Batch analysis worker
//!
//! Consumes batch jobs from SQS and analyzes each batch's games with a pool
//! of native engine processes, one per worker.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use batch_analyzer::db::{self, PgStore};
use batch_analyzer::models::JobMessage;
use batch_analyzer::sqs::SqsClient;
use batch_analyzer::{BatchProcessor, JobConsumer, ProcessLauncher, WorkerConfig};

/// Parse `--local-batch <owner> <batch_index> <num_games>` from CLI args
fn parse_local_batch() -> anyhow::Result<Option<JobMessage>> {
    let args: Vec<String> = std::env::args().collect();
    let Some(pos) = args.iter().position(|a| a == "--local-batch") else {
        return Ok(None);
    };
    let [owner, batch_index, num_games] = match args.get(pos + 1..pos + 4) {
        Some([a, b, c]) => [a, b, c],
        _ => bail!("usage: --local-batch <owner> <batch_index> <num_games>"),
    };

    let job = JobMessage {
        owner: owner.clone(),
        batch_index: batch_index.parse().context("batch_index must be a non-negative integer")?,
        num_games: num_games.parse().context("num_games must be a positive integer")?,
        job_id: None,
        engine_depth: 0,
        engine_move_time_ms: 0,
        engine_use_depth: false,
    };
    if job.num_games == 0 {
        bail!("num_games must be a positive integer");
    }
    Ok(Some(job))
}

/// Resolves on SIGTERM (spot interruption, container stop) or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Load .env file for local dev
    let _ = dotenvy::dotenv();

    // --local-batch mode: one batch straight from the database, skip SQS
    let local_batch = parse_local_batch()?;
    if local_batch.is_some() {
        std::env::set_var("LOCAL_DEV", "1");
        if std::env::var("SQS_QUEUE_URL").is_err() {
            std::env::set_var("SQS_QUEUE_URL", "unused");
        }
    }

    // Load config (fetches DB URL from Secrets Manager in prod)
    let config = WorkerConfig::load().await?;
    info!(
        engine = %config.engine.program,
        workers = ?config.pipeline.workers,
        move_limit = config.pipeline.limits.move_limit,
        job_timeout_secs = config.pipeline.job_timeout.as_secs(),
        "Worker config loaded"
    );

    // Database pool scaled to worker count, with headroom
    let workers = config.pipeline.workers.unwrap_or_else(num_cpus::get);
    let pool_size = (workers + 2) as u32;
    let pool = db::create_pool(&config.database_url, pool_size).await?;
    info!(pool_size, "Database connection pool established");

    if config.run_migrations {
        db::run_migrations(&pool).await?;
        info!("Schema bootstrap complete");
    }

    let launcher = Arc::new(ProcessLauncher {
        command: config.engine.clone(),
        timeouts: config.engine_timeouts,
    });
    let processor = BatchProcessor::new(PgStore::new(pool), launcher, config.pipeline.clone());

    if let Some(job) = local_batch {
        let deadline = Instant::now() + config.pipeline.job_timeout;
        let report = processor.process(&job, deadline).await?;
        println!(
            "Batch {} for {}: {} games, {} analyzed, {} failed",
            job.batch_index, job.owner, report.games, report.analyzed, report.failed
        );
        return Ok(());
    }

    let sqs = SqsClient::new(&config).await?;
    info!(queue_url = %config.sqs_queue_url, "SQS client ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Finishing in-flight batch before exit");
        let _ = shutdown_tx.send(true);
    });

    let consumer = JobConsumer::new(sqs, processor, config.pipeline.clone());
    let summary = consumer.run(shutdown_rx).await;
    info!(
        acknowledged = summary.acknowledged,
        abandoned = summary.abandoned,
        "Graceful shutdown complete"
    );

    Ok(())
}
