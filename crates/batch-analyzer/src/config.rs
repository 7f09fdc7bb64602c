//! Worker configuration from environment variables and AWS Secrets Manager

use std::env;
use std::str::FromStr;
use std::time::Duration;

use aws_sdk_secretsmanager::Client as SecretsClient;
use tracing::info;

use crate::analyzer::AnalysisLimits;
use crate::engine::{EngineCommand, EngineTimeouts};
use crate::error::WorkerError;

const DEFAULT_ENGINE_PATH: &str = "/usr/local/bin/stockfish";

/// Batch processing and queue polling knobs
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Workers per batch; `None` means one per CPU
    pub workers: Option<usize>,
    pub limits: AnalysisLimits,
    /// Per-job deadline
    pub job_timeout: Duration,
    /// Hard backstop beyond the job deadline for teardown
    pub teardown_grace: Duration,
    /// Queue visibility window; must outlast job timeout plus grace
    pub visibility_timeout: Duration,
    pub max_messages: i32,
    pub wait_time: Duration,
    /// Consecutive empty polls before exiting (0 = never)
    pub max_empty_receives: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: None,
            limits: AnalysisLimits::default(),
            job_timeout: Duration::from_secs(120),
            teardown_grace: Duration::from_secs(15),
            visibility_timeout: Duration::from_secs(180),
            max_messages: 5,
            wait_time: Duration::from_secs(20),
            max_empty_receives: 0,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.visibility_timeout <= self.job_timeout + self.teardown_grace {
            return Err(WorkerError::Config(format!(
                "visibility timeout ({}s) must exceed job timeout ({}s) plus teardown grace ({}s)",
                self.visibility_timeout.as_secs(),
                self.job_timeout.as_secs(),
                self.teardown_grace.as_secs()
            )));
        }
        if !(1..=10).contains(&self.max_messages) {
            return Err(WorkerError::Config(format!(
                "SQS_MAX_MESSAGES must be between 1 and 10, got {}",
                self.max_messages
            )));
        }
        if self.limits.move_limit == 0 {
            return Err(WorkerError::Config("ENGINE_NUMBER_OF_MOVES must be positive".into()));
        }
        if self.workers == Some(0) {
            return Err(WorkerError::Config("WORKERS must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Database connection URL (fetched from Secrets Manager in prod)
    pub database_url: String,

    /// SQS queue URL for batch jobs
    pub sqs_queue_url: String,

    /// Custom SQS endpoint URL (for LocalStack)
    pub sqs_endpoint_url: Option<String>,

    /// Engine binary and arguments
    pub engine: EngineCommand,

    pub engine_timeouts: EngineTimeouts,

    pub pipeline: PipelineSettings,

    /// Bootstrap tables at startup
    pub run_migrations: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    /// In production, fetches DATABASE_URL from AWS Secrets Manager.
    pub async fn load() -> Result<Self, WorkerError> {
        let var = |name: &str| env::var(name).ok();

        // Determine database URL
        let database_url = if var("LOCAL_DEV").is_some() {
            // Local development: use DATABASE_URL directly
            info!("Local dev mode: using DATABASE_URL from environment");
            var("DATABASE_URL")
                .ok_or_else(|| WorkerError::Config("DATABASE_URL not set (LOCAL_DEV mode)".into()))?
        } else {
            // Production: fetch from Secrets Manager
            let secret_arn = var("DB_SECRET_ARN")
                .ok_or_else(|| WorkerError::Config("DB_SECRET_ARN not set".into()))?;

            info!(secret_arn = %secret_arn, "Fetching database URL from Secrets Manager");
            fetch_database_url_from_secrets(&secret_arn).await?
        };

        Self::from_vars(var, database_url)
    }

    fn from_vars(
        var: impl Fn(&str) -> Option<String>,
        database_url: String,
    ) -> Result<Self, WorkerError> {
        let sqs_queue_url = var("SQS_QUEUE_URL")
            .or_else(|| var("QUEUE_URL"))
            .ok_or_else(|| WorkerError::Config("SQS_QUEUE_URL not set".into()))?;

        let sqs_endpoint_url = var("SQS_ENDPOINT_URL").filter(|v| !v.is_empty());

        let program = var("ENGINE_PATH")
            .or_else(|| var("STOCKFISH_PATH"))
            .unwrap_or_else(|| DEFAULT_ENGINE_PATH.to_string());
        let args = var("ENGINE_ARGS")
            .map(|v| v.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        let startup = Duration::from_secs(parse_var(&var, "ENGINE_STARTUP_TIMEOUT_SECS", 10)?);
        let engine_timeouts = EngineTimeouts {
            startup,
            ready: startup,
            stop_grace: Duration::from_millis(parse_var(&var, "ENGINE_STOP_GRACE_MS", 500)?),
        };

        let workers = var("WORKERS")
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| WorkerError::Config(format!("WORKERS is not a number: '{v}'")))
            })
            .transpose()?;

        let pipeline = PipelineSettings {
            workers,
            limits: AnalysisLimits {
                move_limit: parse_var(&var, "ENGINE_NUMBER_OF_MOVES", 40)?,
                position_timeout: Duration::from_millis(parse_var(
                    &var,
                    "ENGINE_POSITION_TIMEOUT_MS",
                    2000,
                )?),
            },
            job_timeout: Duration::from_secs(parse_var(&var, "JOB_TIMEOUT_SECS", 120)?),
            teardown_grace: Duration::from_secs(parse_var(&var, "JOB_TEARDOWN_GRACE_SECS", 15)?),
            visibility_timeout: Duration::from_secs(parse_var(&var, "VISIBILITY_TIMEOUT_SECS", 180)?),
            max_messages: parse_var(&var, "SQS_MAX_MESSAGES", 5)?,
            wait_time: Duration::from_secs(parse_var(&var, "SQS_WAIT_TIME_SECS", 20)?),
            max_empty_receives: parse_var(&var, "MAX_EMPTY_RECEIVES", 0)?,
        };
        pipeline.validate()?;

        Ok(Self {
            database_url,
            sqs_queue_url,
            sqs_endpoint_url,
            engine: EngineCommand { program, args },
            engine_timeouts,
            pipeline,
            run_migrations: var("RUN_MIGRATIONS").is_some_and(|v| v != "0" && v != "false"),
        })
    }
}

fn parse_var<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, WorkerError> {
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| WorkerError::Config(format!("{name} has an invalid value: '{raw}'"))),
        None => Ok(default),
    }
}

/// Fetch database URL from AWS Secrets Manager
async fn fetch_database_url_from_secrets(secret_arn: &str) -> Result<String, WorkerError> {
    let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let client = SecretsClient::new(&config);

    let response = client
        .get_secret_value()
        .secret_id(secret_arn)
        .send()
        .await
        .map_err(|e| WorkerError::SecretsManager(e.to_string()))?;

    let secret_string = response
        .secret_string()
        .ok_or_else(|| WorkerError::SecretsManager("Secret has no string value".into()))?;

    database_url_from_secret(secret_string)
}

/// The secret is either a plain connection string or a JSON object with
/// the URL or its parts.
fn database_url_from_secret(secret_string: &str) -> Result<String, WorkerError> {
    if secret_string.starts_with("postgresql://") || secret_string.starts_with("postgres://") {
        return Ok(secret_string.to_string());
    }

    let secret: serde_json::Value = serde_json::from_str(secret_string)
        .map_err(|e| WorkerError::SecretsManager(format!("Failed to parse secret JSON: {e}")))?;

    if let Some(url) = secret.get("url").or(secret.get("DATABASE_URL")) {
        return url
            .as_str()
            .map(String::from)
            .ok_or_else(|| WorkerError::SecretsManager("Database URL is not a string".into()));
    }

    let field = |name: &str| {
        secret
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| WorkerError::SecretsManager(format!("Missing '{name}' in secret")))
    };
    let host = field("host")?;
    let username = field("username")?;
    let password = field("password")?;
    let database = field("dbname").or_else(|_| field("database"))?;
    let port = secret.get("port").and_then(|v| v.as_u64()).unwrap_or(5432);

    Ok(format!("postgresql://{username}:{password}@{host}:{port}/{database}"))
}
