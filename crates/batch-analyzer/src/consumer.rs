//! Queue consumer: turns batch descriptors into analyzed, persisted games.
//!
//! A message is deleted only after its batch has been fully analyzed,
//! persisted and counted. Its visibility window is renewed when processing
//! starts, so a message waiting behind others from the same poll still has
//! a full window for its own deadline. Every failure short of that leaves the message to
//! be redelivered when its visibility window lapses; the storage writes are
//! idempotent, so reprocessing never double-counts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{error, info, warn};

use crate::config::PipelineSettings;
use crate::db::AnalysisStore;
use crate::engine::EngineLauncher;
use crate::error::WorkerError;
use crate::models::{JobMessage, JobProgress};
use crate::pool::{run_batch, PoolContext};
use crate::sqs::{JobQueue, QueueMessage};

const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// What became of one received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Processed and deleted
    Acknowledged,
    /// Left for redelivery
    Abandoned,
    /// Malformed and deleted without processing
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub polls: u64,
    pub acknowledged: u64,
    pub abandoned: u64,
    pub discarded: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Acknowledged => self.acknowledged += 1,
            MessageOutcome::Abandoned => self.abandoned += 1,
            MessageOutcome::Discarded => self.discarded += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub games: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub progress: Option<JobProgress>,
}

/// Loads, analyzes and persists one batch.
pub struct BatchProcessor<S, L> {
    store: S,
    launcher: Arc<L>,
    settings: PipelineSettings,
}

impl<S: AnalysisStore, L: EngineLauncher> BatchProcessor<S, L> {
    pub fn new(store: S, launcher: Arc<L>, settings: PipelineSettings) -> Self {
        Self {
            store,
            launcher,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn process(
        &self,
        job: &JobMessage,
        deadline: Instant,
    ) -> Result<BatchReport, WorkerError> {
        let games = self
            .store
            .load_games(&job.owner, job.num_games, job.offset())
            .await?;
        info!(
            owner = %job.owner,
            batch_index = job.batch_index,
            games = games.len(),
            "Loaded batch"
        );

        let engine_settings = job.engine_settings();
        let ctx = Arc::new(PoolContext {
            owner: job.owner.clone(),
            settings: engine_settings,
            limits: self.settings.limits,
            workers: self.settings.workers,
            job_deadline: deadline,
        });
        let outcome = run_batch(self.launcher.clone(), games, ctx).await?;

        if Instant::now() >= deadline {
            return Err(WorkerError::DeadlineExceeded);
        }
        if outcome.untried_games > 0 {
            return Err(WorkerError::IncompleteBatch {
                untried: outcome.untried_games,
            });
        }

        for result in outcome.results.iter().filter(|r| !r.records.is_empty()) {
            self.store
                .upsert_move_records(result.game_id, &result.records, &engine_settings)
                .await?;
        }

        let progress = match job.tracked_job_id() {
            Some(job_id) => {
                let progress = self.store.upsert_job_progress(job_id, job.batch_index).await?;
                if let Some(p) = &progress {
                    info!(
                        job_id,
                        completed = p.completed_batches,
                        total = p.total_batches,
                        status = %p.status,
                        counted = p.counted,
                        "Job progress updated"
                    );
                }
                progress
            }
            None => None,
        };

        Ok(BatchReport {
            games: outcome.total_games,
            analyzed: outcome.results.len(),
            failed: outcome.failed_games.len(),
            progress,
        })
    }
}

/// Polls the queue and drives one batch at a time.
pub struct JobConsumer<Q, S, L> {
    queue: Q,
    processor: BatchProcessor<S, L>,
    settings: PipelineSettings,
}

impl<Q: JobQueue, S: AnalysisStore, L: EngineLauncher> JobConsumer<Q, S, L> {
    pub fn new(queue: Q, processor: BatchProcessor<S, L>, settings: PipelineSettings) -> Self {
        Self {
            queue,
            processor,
            settings,
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn processor(&self) -> &BatchProcessor<S, L> {
        &self.processor
    }

    /// Received → Processing → Acknowledged | Abandoned, or Discarded for
    /// payloads that can never succeed.
    pub async fn handle_message(&self, message: &QueueMessage) -> MessageOutcome {
        let job = match JobMessage::decode(&message.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, body = %message.body, "Discarding malformed job message");
                if let Err(e) = self.queue.delete(&message.receipt_handle).await {
                    warn!(error = %e, "Failed to delete malformed message");
                }
                return MessageOutcome::Discarded;
            }
        };

        if let Err(e) = self
            .queue
            .extend_visibility(&message.receipt_handle, self.settings.visibility_timeout)
            .await
        {
            error!(owner = %job.owner, batch_index = job.batch_index, error = %e, "Failed to renew visibility, leaving for redelivery");
            return MessageOutcome::Abandoned;
        }

        let deadline = Instant::now() + self.settings.job_timeout;
        let hard_stop = deadline + self.settings.teardown_grace;
        info!(
            owner = %job.owner,
            batch_index = job.batch_index,
            num_games = job.num_games,
            job_id = ?job.tracked_job_id(),
            "Processing batch"
        );

        let report = match timeout_at(hard_stop, self.processor.process(&job, deadline)).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                error!(owner = %job.owner, batch_index = job.batch_index, error = %e, "Batch failed, leaving for redelivery");
                return MessageOutcome::Abandoned;
            }
            Err(_) => {
                error!(owner = %job.owner, batch_index = job.batch_index, "Batch overran teardown grace, leaving for redelivery");
                return MessageOutcome::Abandoned;
            }
        };

        match self.queue.delete(&message.receipt_handle).await {
            Ok(()) => {
                info!(
                    owner = %job.owner,
                    batch_index = job.batch_index,
                    games = report.games,
                    analyzed = report.analyzed,
                    failed = report.failed,
                    "Batch complete"
                );
                MessageOutcome::Acknowledged
            }
            Err(e) => {
                error!(batch_index = job.batch_index, error = %e, "Failed to acknowledge batch, it will be redelivered");
                MessageOutcome::Abandoned
            }
        }
    }

    /// Consume until shutdown is signalled (or its sender is gone), or until
    /// the configured number of consecutive empty polls. A batch already in
    /// progress is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut empty_receives = 0u32;

        info!("Starting consumer loop");
        'poll: loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                received = self.queue.receive(self.settings.max_messages, self.settings.wait_time) => received,
            };
            summary.polls += 1;

            match received {
                Ok(messages) if messages.is_empty() => {
                    empty_receives += 1;
                    let limit = self.settings.max_empty_receives;
                    if limit > 0 && empty_receives >= limit {
                        info!("No messages after {limit} polls, exiting");
                        break;
                    }
                }
                Ok(messages) => {
                    empty_receives = 0;
                    for message in &messages {
                        if *shutdown.borrow() {
                            break 'poll;
                        }
                        summary.record(self.handle_message(message).await);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive messages");
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        info!(
            polls = summary.polls,
            acknowledged = summary.acknowledged,
            abandoned = summary.abandoned,
            discarded = summary.discarded,
            "Consumer stopped"
        );
        summary
    }
}
