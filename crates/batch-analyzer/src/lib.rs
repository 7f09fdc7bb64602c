//! Batch move-quality analyzer
//!
//! Consumes batch descriptors from SQS, analyzes each game of the batch with
//! a pool of UCI engine processes and stores per-move classifications.

pub mod analysis;
pub mod analyzer;
pub mod config;
pub mod consumer;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod pool;
pub mod sqs;

#[cfg(test)]
mod testing;

pub use config::{PipelineSettings, WorkerConfig};
pub use consumer::{BatchProcessor, JobConsumer, MessageOutcome, RunSummary};
pub use engine::{EngineCommand, EngineLauncher, EngineSession, EngineTimeouts, Evaluator, ProcessLauncher};
pub use error::WorkerError;
