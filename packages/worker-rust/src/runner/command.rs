//! Subprocess execution context.
//!
//! [`CommandRunner`] runs an external program per job, so a crash in the job
//! (segfault, abort, OOM kill) takes down only the child. The child's exit
//! status is the job's outcome:
//!
//! | exit                | outcome      |
//! |---------------------|--------------|
//! | 0                   | success      |
//! | 65 (`EX_DATAERR`)   | content      |
//! | 75 (`EX_TEMPFAIL`)  | transient    |
//! | killed by signal    | crash        |
//! | any other code      | unclassified |

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use workq_core::JobError;

use super::{JobContext, JobRunner};

/// Exit code for malformed job input (`sysexits.h`).
pub const EXIT_CONTENT_ERROR: i32 = 65;
/// Exit code for a temporary failure worth retrying (`sysexits.h`).
pub const EXIT_TRANSIENT_ERROR: i32 = 75;

const DEFAULT_STDERR_TAIL: usize = 4096;

/// Runs each job as a child process.
///
/// The child receives the job id as its last argument and in `WORKQ_JOB_ID`,
/// plus `WORKQ_MESSAGE_ID`, `WORKQ_MESSAGE_BODY` and, when known,
/// `WORKQ_DELIVERY_COUNT`. Stdout is inherited; stderr is captured and its
/// tail attached to the failure.
///
/// The child is killed if the run future is dropped.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: OsString,
    args: Vec<OsString>,
    stderr_tail: usize,
}

impl CommandRunner {
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stderr_tail: DEFAULT_STDERR_TAIL,
        }
    }

    /// Arguments placed before the job id.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Maximum bytes of stderr kept as failure detail.
    #[must_use]
    pub fn stderr_tail(mut self, bytes: usize) -> Self {
        self.stderr_tail = bytes;
        self
    }

    fn command(&self, ctx: &JobContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(ctx.job_id.as_str())
            .env("WORKQ_JOB_ID", ctx.job_id.as_str())
            .env("WORKQ_MESSAGE_ID", &ctx.message_id.0)
            .env("WORKQ_MESSAGE_BODY", &ctx.body)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(count) = ctx.delivery_count {
            cmd.env("WORKQ_DELIVERY_COUNT", count.to_string());
        }
        cmd
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        let output = self.command(&ctx).output().await.map_err(|err| {
            JobError::crash(format!("failed to start {}", self.program.to_string_lossy()))
                .with_detail(err.to_string())
        })?;

        let stderr = tail(&String::from_utf8_lossy(&output.stderr), self.stderr_tail);
        debug!(status = %output.status, stderr_bytes = output.stderr.len(), "job process exited");
        outcome(output.status, &stderr)
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    let text = text.trim_end();
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn outcome(status: ExitStatus, stderr: &str) -> Result<(), JobError> {
    if status.success() {
        return Ok(());
    }

    // The job's own diagnosis, if it printed one.
    let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).map(str::trim);
    let message = |fallback: String| last_line.map_or(fallback, str::to_string);
    let with_stderr = |err: JobError| {
        if stderr.is_empty() {
            err
        } else {
            err.with_detail(stderr)
        }
    };

    let err = match status.code() {
        Some(EXIT_CONTENT_ERROR) => JobError::content(message(format!("job rejected its input ({status})"))),
        Some(EXIT_TRANSIENT_ERROR) => JobError::transient(message(format!("job hit a temporary failure ({status})"))),
        Some(code) => JobError::unclassified(message(format!("job process exited with code {code}"))),
        None => JobError::crash(killed_message(status)),
    };
    Err(with_stderr(err))
}

#[cfg(unix)]
fn killed_message(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("job process killed by signal {signal}"),
        None => format!("job process terminated abnormally ({status})"),
    }
}

#[cfg(not(unix))]
fn killed_message(status: ExitStatus) -> String {
    format!("job process terminated abnormally ({status})")
}

#[cfg(all(test, unix))]
mod tests {
    use workq_core::JobErrorKind;

    use super::*;
    use crate::runner::tests::context;

    fn sh(script: &str) -> CommandRunner {
        // `sh -c script argv0 job_id` puts the job id in $1.
        CommandRunner::new("sh").args(["-c", script, "sh"])
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        sh("test \"$1\" = 9 && test \"$WORKQ_JOB_ID\" = 9")
            .run(context("9", &[]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn data_error_exit_is_content_error() {
        let err = sh("echo 'row 3: bad date' >&2; exit 65")
            .run(context("1", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Content);
        assert_eq!(err.message, "row 3: bad date");
    }

    #[tokio::test]
    async fn tempfail_exit_is_transient() {
        let err = sh("exit 75").run(context("1", &[])).await.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Transient);
        assert!(err.detail.is_none());
    }

    #[tokio::test]
    async fn other_exit_is_unclassified() {
        let err = sh("exit 3").run(context("1", &[])).await.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Unclassified);
        assert!(err.message.contains('3'));
    }

    #[tokio::test]
    async fn signal_death_is_crash_with_stderr_detail() {
        let err = sh("echo 'Traceback: boom' >&2; kill -9 $$")
            .run(context("1", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Crash);
        assert!(err.message.contains("signal 9"));
        assert_eq!(err.detail.as_deref(), Some("Traceback: boom"));
    }

    #[tokio::test]
    async fn missing_program_is_crash() {
        let err = CommandRunner::new("/nonexistent/workq-job")
            .run(context("1", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Crash);
    }

    #[test]
    fn tail_keeps_last_bytes_on_char_boundary() {
        assert_eq!(tail("abcdef\n", 3), "def");
        assert_eq!(tail("short", 64), "short");
        assert_eq!(tail("aé", 1), "");
    }
}
