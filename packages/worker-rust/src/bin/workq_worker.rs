//! `workq-worker`: runs the dispatcher against a local in-memory queue,
//! executing each job with an external command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::info;
use workq_core::{job_reference, AttributeValue, JobId, JobStatus, RedrivePolicy};
use workq_worker::{
    init_tracing, spawn_signal_listener, CommandRunner, DispatcherConfig, InMemoryQueue,
    InMemoryStatusStore, LogFormat, RunExit, ShutdownController, WorkDispatcher,
};

#[derive(Parser, Debug)]
#[command(name = "workq-worker")]
#[command(version)]
#[command(about = "Lease/heartbeat work dispatcher over a visibility-timeout queue", long_about = None)]
struct Cli {
    /// Name attached to every log line
    #[arg(long, env = "WORKQ_WORKER_NAME", default_value = "workq-worker")]
    worker_name: String,

    /// Long-poll wait per receive, in seconds
    #[arg(long, env = "WORKQ_WAIT_SECS", default_value_t = 10)]
    wait_secs: u64,

    /// Visibility timeout granted on receive and on every extension, in seconds
    #[arg(long, env = "WORKQ_VISIBILITY_TIMEOUT_SECS", default_value_t = 600)]
    visibility_timeout_secs: u64,

    /// Heartbeat interval in seconds (default: half the visibility timeout)
    #[arg(long, env = "WORKQ_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    /// Ceiling on how long one lease may be held, in seconds
    #[arg(long, env = "WORKQ_MAX_VISIBILITY_TIMEOUT_SECS", default_value_t = 4 * 60 * 60)]
    max_visibility_timeout_secs: u64,

    /// Sleep after an empty receive, in milliseconds
    #[arg(long, env = "WORKQ_EMPTY_QUEUE_BACKOFF_MS", default_value_t = 1000)]
    empty_queue_backoff_ms: u64,

    /// Sleep after a failed receive, in seconds
    #[arg(long, env = "WORKQ_QUEUE_ERROR_BACKOFF_SECS", default_value_t = 5)]
    queue_error_backoff_secs: u64,

    /// Messages per receive (valid range: 1-10)
    #[arg(long, env = "WORKQ_MAX_MESSAGES", default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=10))]
    max_messages: u8,

    /// Message attribute carrying the job id; the body is used when absent
    #[arg(long, env = "WORKQ_JOB_ID_ATTRIBUTE", default_value = "job_id")]
    job_id_attribute: String,

    /// Log format: json or pretty
    #[arg(long, env = "WORKQ_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// JSON-lines file of messages to enqueue at startup
    #[arg(long, env = "WORKQ_SEED")]
    seed: Option<PathBuf>,

    /// Dead-letter a message after this many receives
    #[arg(long, env = "WORKQ_MAX_RECEIVE_COUNT", value_parser = clap::value_parser!(u32).range(1..))]
    max_receive_count: Option<u32>,

    /// Exit once the queue is empty instead of polling forever
    #[arg(long, env = "WORKQ_EXIT_WHEN_IDLE")]
    exit_when_idle: bool,

    /// Command run per job; the job id is appended as its last argument
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

impl Cli {
    fn dispatcher_config(&self) -> DispatcherConfig {
        let visibility_timeout = Duration::from_secs(self.visibility_timeout_secs);
        DispatcherConfig {
            worker_name: self.worker_name.clone(),
            wait_time: Duration::from_secs(self.wait_secs),
            visibility_timeout,
            heartbeat_interval: self
                .heartbeat_secs
                .map_or(visibility_timeout / 2, Duration::from_secs),
            max_visibility_timeout: Duration::from_secs(self.max_visibility_timeout_secs),
            empty_queue_backoff: Duration::from_millis(self.empty_queue_backoff_ms),
            queue_error_backoff: Duration::from_secs(self.queue_error_backoff_secs),
            max_messages: usize::from(self.max_messages),
            job_id_attribute: self.job_id_attribute.clone(),
            exit_when_idle: self.exit_when_idle,
        }
    }
}

/// One line of the seed file.
#[derive(Debug, Deserialize)]
struct SeedMessage {
    body: String,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
    /// Initial job status; `ready` when omitted.
    #[serde(default)]
    status: Option<JobStatus>,
}

/// Enqueues every seed message and registers its job in the status store.
fn seed(
    path: &Path,
    queue: &InMemoryQueue,
    status: &InMemoryStatusStore,
    job_id_attribute: &str,
) -> Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;

    let mut count = 0;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let message: SeedMessage = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid seed message", path.display(), idx + 1))?;

        if let Some(job_id) = job_reference(&message.body, &message.attributes, job_id_attribute) {
            status.insert(JobId::new(job_id), message.status.unwrap_or(JobStatus::Ready));
        }
        queue.send(message.body, message.attributes);
        count += 1;
    }
    Ok(count)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.dispatcher_config();
    config.validate().context("invalid configuration")?;

    let mut queue = InMemoryQueue::new();
    if let Some(max_receive_count) = cli.max_receive_count {
        queue = queue.with_redrive(RedrivePolicy { max_receive_count });
    }
    let status = InMemoryStatusStore::new();
    if let Some(path) = &cli.seed {
        let count = seed(path, &queue, &status, &config.job_id_attribute)?;
        info!(messages = count, path = %path.display(), "queue seeded");
    }

    let (program, args) = cli.command.split_first().context("missing job command")?;
    let runner = CommandRunner::new(program).args(args);

    let shutdown = Arc::new(ShutdownController::new());
    let _signals = spawn_signal_listener(Arc::clone(&shutdown)).context("installing signal handlers")?;

    let dispatcher = WorkDispatcher::new(Arc::new(queue), Arc::new(status), Arc::new(runner), config)
        .with_shutdown(shutdown);
    match dispatcher.run().await? {
        RunExit::Drained | RunExit::Idle => Ok(()),
        RunExit::Forced => std::process::exit(130),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn cli_defaults_match_dispatcher_defaults() {
        let cli = Cli::try_parse_from(["workq-worker", "--", "true"]).unwrap();
        let config = cli.dispatcher_config();
        let defaults = DispatcherConfig::default();
        assert_eq!(config.visibility_timeout, defaults.visibility_timeout);
        assert_eq!(config.heartbeat_interval, defaults.heartbeat_interval);
        assert_eq!(config.max_visibility_timeout, defaults.max_visibility_timeout);
        assert_eq!(config.empty_queue_backoff, defaults.empty_queue_backoff);
        assert_eq!(config.max_messages, defaults.max_messages);
        assert_eq!(cli.command, vec!["true"]);
    }

    #[test]
    fn trailing_command_keeps_its_flags() {
        let cli = Cli::try_parse_from([
            "workq-worker",
            "--visibility-timeout-secs",
            "60",
            "generate",
            "--format",
            "csv",
        ])
        .unwrap();
        assert_eq!(cli.command, vec!["generate", "--format", "csv"]);
        assert_eq!(cli.dispatcher_config().heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn batch_size_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["workq-worker", "--max-messages", "11", "true"]).is_err());
    }

    #[test]
    fn seed_file_fills_queue_and_status_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"body": "1"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"body": "x", "attributes": {{"job_id": 2}}, "status": "finished"}}"#).unwrap();

        let queue = InMemoryQueue::new();
        let status = InMemoryStatusStore::new();
        let count = seed(file.path(), &queue, &status, "job_id").unwrap();

        assert_eq!(count, 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(status.record(&JobId::from("1")).unwrap().status, JobStatus::Ready);
        assert_eq!(status.record(&JobId::from("2")).unwrap().status, JobStatus::Finished);
    }

    #[test]
    fn malformed_seed_line_reports_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();

        let err = seed(file.path(), &InMemoryQueue::new(), &InMemoryStatusStore::new(), "job_id").unwrap_err();
        assert!(err.to_string().ends_with(":1: invalid seed message"));
    }
}
