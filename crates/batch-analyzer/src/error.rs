//! Worker error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("Secrets Manager error: {0}")]
    SecretsManager(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Process failed to launch or never reached ready. Fatal to one worker.
    #[error("Engine startup error: {0}")]
    EngineStartup(String),

    /// Session used before it completed its handshake, or after close.
    #[error("Engine not ready")]
    EngineNotReady,

    /// I/O or protocol failure on a running session. The session is closed.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Malformed game record. Fatal to that one game.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Malformed queue payload. The message is deleted, never retried.
    #[error("Queue decode error: {0}")]
    QueueDecode(String),

    #[error("Job deadline exceeded")]
    DeadlineExceeded,

    #[error("No engine could be started for the batch")]
    NoEngines,

    #[error("Batch incomplete: {untried} games were never analyzed")]
    IncompleteBatch { untried: usize },
}
