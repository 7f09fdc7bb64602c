//! SQS client wrapper for the batch job queue

use std::future::Future;
use std::time::Duration;

use aws_sdk_sqs::Client;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// A message received from the queue
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Message body (a JSON batch descriptor)
    pub body: String,
    /// Receipt handle for deletion
    pub receipt_handle: String,
}

/// At-least-once job queue. A received message that is never deleted is
/// redelivered once its visibility window lapses.
pub trait JobQueue: Send + Sync {
    fn receive(
        &self,
        max_messages: i32,
        wait: Duration,
    ) -> impl Future<Output = Result<Vec<QueueMessage>, WorkerError>> + Send;

    fn delete(&self, receipt_handle: &str) -> impl Future<Output = Result<(), WorkerError>> + Send;

    /// Restart a received message's visibility window at `timeout` from now.
    fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), WorkerError>> + Send;
}

/// SQS client for receiving and acknowledging batch jobs
#[derive(Clone)]
pub struct SqsClient {
    client: Client,
    queue_url: String,
    visibility_timeout: i32,
}

impl SqsClient {
    /// Create a new SQS client
    pub async fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        // For LocalStack/local dev, use custom endpoint
        let client = if let Some(endpoint) = &config.sqs_endpoint_url {
            let sqs_config = aws_sdk_sqs::config::Builder::from(&aws_config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(sqs_config)
        } else {
            Client::new(&aws_config)
        };

        let visibility_timeout = i32::try_from(config.pipeline.visibility_timeout.as_secs())
            .map_err(|_| WorkerError::Config("VISIBILITY_TIMEOUT_SECS out of range".into()))?;

        Ok(Self {
            client,
            queue_url: config.sqs_queue_url.clone(),
            visibility_timeout,
        })
    }
}

impl JobQueue for SqsClient {
    /// Receive messages with long polling
    async fn receive(
        &self,
        max_messages: i32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, WorkerError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .visibility_timeout(self.visibility_timeout)
            .send()
            .await
            .map_err(|e| WorkerError::Sqs(format!("Failed to receive messages: {e}")))?;

        let messages: Vec<QueueMessage> = response
            .messages()
            .iter()
            .filter_map(|msg| {
                let body = msg.body()?;
                let receipt = msg.receipt_handle()?;
                Some(QueueMessage {
                    body: body.to_string(),
                    receipt_handle: receipt.to_string(),
                })
            })
            .collect();

        debug!(count = messages.len(), "Received messages");
        Ok(messages)
    }

    /// Delete a message from the queue (after successful processing)
    async fn delete(&self, receipt_handle: &str) -> Result<(), WorkerError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| WorkerError::Sqs(format!("Failed to delete message: {e}")))?;

        debug!("Deleted message");
        Ok(())
    }

    /// Extend visibility timeout (for long-running batches)
    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        let timeout_seconds = i32::try_from(timeout.as_secs())
            .map_err(|_| WorkerError::Sqs(format!("Visibility timeout out of range: {timeout:?}")))?;

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout_seconds)
            .send()
            .await
            .map_err(|e| WorkerError::Sqs(format!("Failed to extend visibility: {e}")))?;

        debug!(timeout_seconds, "Extended visibility");
        Ok(())
    }
}
