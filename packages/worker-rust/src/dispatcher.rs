//! Work dispatcher: receive, lease, run alongside the heartbeat, resolve.
//!
//! Per message the dispatcher walks
//! `IDLE -> POLLING -> LEASED -> RUNNING -> RESOLVING -> IDLE`:
//!
//! 1. `receive` a batch; an empty batch backs off and polls again.
//! 2. Extract the job id and consult the status store. Terminal jobs are
//!    duplicate deliveries: the message is deleted without running.
//! 3. Mark the job `running`, start the heartbeat, and run the job on its
//!    own task so a panic cannot take down the poll loop.
//! 4. Once the job's task has terminated, stop the heartbeat, classify the
//!    outcome, write the status, then delete or release the message.
//!
//! Shutdown is cooperative. A graceful request is checked between messages
//! and never interrupts a running job; an immediate request abandons the job
//! and leaves its lease to expire.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use workq_core::{
    classify, Disposition, JobError, JobId, JobOutcome, JobStatus, MessageId, QueueMessage,
    Resolution, ResolutionReason, RetryBudget,
};

use crate::config::{ConfigError, DispatcherConfig};
use crate::lease::Lease;
use crate::queue::{QueueClient, QueueError};
use crate::runner::{JobContext, JobRunner};
use crate::shutdown::{ShutdownController, ShutdownSignal};
use crate::status::{StatusError, StatusReporter};

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

/// Errors surfaced by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The job's execution context died. The job was marked failed and its
    /// message released before this was returned.
    #[error("job {job_id} execution crashed: {reason}")]
    ExecutionCrashed { job_id: JobId, reason: String },
    /// The status store could not be read or written. Lease resolution can
    /// no longer be guaranteed, so the poll loop stops.
    #[error("status store failed for job {job_id}: {source}")]
    StatusStore { job_id: JobId, source: StatusError },
    /// `receive` failed. The poll loop backs off and tries again.
    #[error("receive failed: {0}")]
    QueueUnavailable(QueueError),
    /// Immediate shutdown abandoned the running job.
    #[error("job {job_id} abandoned by immediate shutdown")]
    Interrupted { job_id: JobId },
    #[error("invalid dispatcher configuration: {0}")]
    Config(#[from] ConfigError),
}

impl DispatchError {
    /// Whether the poll loop must stop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::StatusStore { .. } | DispatchError::Config(_))
    }
}

/// What the dispatcher did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handling {
    /// The job ran and its outcome was classified.
    Ran(ResolutionReason),
    /// The job was already terminal; the delivery was a duplicate.
    SkippedDuplicate(JobStatus),
    /// No job id, or the status store does not know the job.
    Rejected,
    /// Received but not started because shutdown was requested.
    Returned,
}

/// Summary of one message's lifecycle.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub message_id: MessageId,
    pub job_id: Option<JobId>,
    pub handling: Handling,
    /// The job's error, if it failed.
    pub error: Option<JobError>,
    /// Whether the final delete/release call succeeded.
    pub lease_resolved: bool,
    /// Successful heartbeat extensions.
    pub extensions: u32,
    pub elapsed: Duration,
}

/// Result of one receive-and-handle cycle.
#[derive(Debug)]
pub enum PollOutcome {
    /// The receive returned no messages.
    Idle,
    /// Every received message was handled, in order.
    Handled(Vec<JobReport>),
}

/// How [`WorkDispatcher::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Graceful shutdown: the in-flight job finished and its lease was resolved.
    Drained,
    /// Immediate shutdown: the in-flight lease was left to expire.
    Forced,
    /// The queue was empty and `exit_when_idle` is set.
    Idle,
}

// ---------------------------------------------------------------------------
// WorkDispatcher
// ---------------------------------------------------------------------------

/// Runs one job at a time off a visibility-timeout queue.
pub struct WorkDispatcher<Q, S, R> {
    queue: Arc<Q>,
    status: Arc<S>,
    runner: Arc<R>,
    config: DispatcherConfig,
    shutdown: Arc<ShutdownController>,
}

impl<Q, S, R> WorkDispatcher<Q, S, R>
where
    Q: QueueClient,
    S: StatusReporter,
    R: JobRunner,
{
    #[must_use]
    pub fn new(queue: Arc<Q>, status: Arc<S>, runner: Arc<R>, config: DispatcherConfig) -> Self {
        Self {
            queue,
            status,
            runner,
            config,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Shares an existing shutdown controller (e.g. one wired to OS signals).
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownController>) -> Self {
        self.shutdown = shutdown;
        self
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs the poll loop until shutdown or an unrecoverable error.
    ///
    /// Crashed jobs and queue outages are logged and the loop continues.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] for an invalid configuration and
    /// [`DispatchError::StatusStore`] when the status store fails.
    pub async fn run(&self) -> Result<RunExit, DispatchError> {
        self.config.validate()?;
        self.shutdown.set_polling();
        info!(
            worker = %self.config.worker_name,
            wait_secs = self.config.wait_time.as_secs(),
            visibility_timeout_secs = self.config.visibility_timeout.as_secs(),
            heartbeat_secs = self.config.heartbeat_interval.as_secs(),
            "poll loop started"
        );

        let exit = loop {
            match self.shutdown.signal() {
                ShutdownSignal::None => {}
                ShutdownSignal::Graceful => break RunExit::Drained,
                ShutdownSignal::Immediate => break RunExit::Forced,
            }

            match self.dispatch_once().await {
                Ok(PollOutcome::Handled(_)) => {}
                Ok(PollOutcome::Idle) if self.config.exit_when_idle => break RunExit::Idle,
                Ok(PollOutcome::Idle) => self.backoff(self.config.empty_queue_backoff).await,
                Err(DispatchError::Interrupted { .. }) => break RunExit::Forced,
                Err(DispatchError::QueueUnavailable(err)) => {
                    warn!(
                        error = %err,
                        backoff_secs = self.config.queue_error_backoff.as_secs(),
                        "queue unavailable, backing off"
                    );
                    self.backoff(self.config.queue_error_backoff).await;
                }
                Err(err) if !err.is_fatal() => {
                    error!(error = %err, "job failed outside its own error handling");
                }
                Err(err) => {
                    self.shutdown.set_stopped();
                    error!(error = %err, "dispatcher stopping");
                    return Err(err);
                }
            }
        };

        self.shutdown.set_stopped();
        info!(worker = %self.config.worker_name, exit = ?exit, "shutdown completed");
        Ok(exit)
    }

    /// Receives one batch and handles every message in it.
    ///
    /// Messages not yet started when shutdown is requested are released
    /// with a zero timeout.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]. On any error other than `Interrupted`, the
    /// batch's unstarted messages are released first.
    pub async fn dispatch_once(&self) -> Result<PollOutcome, DispatchError> {
        debug!(worker = %self.config.worker_name, "polling queue");
        let batch = self
            .queue
            .receive(
                self.config.wait_time,
                self.config.visibility_timeout,
                self.config.max_messages,
            )
            .await
            .map_err(DispatchError::QueueUnavailable)?;
        if batch.is_empty() {
            return Ok(PollOutcome::Idle);
        }

        let mut reports = Vec::with_capacity(batch.len());
        let mut pending = batch.into_iter();
        while let Some(message) = pending.next() {
            if self.shutdown.is_shutting_down() {
                for unstarted in std::iter::once(message).chain(pending.by_ref()) {
                    reports.push(self.return_unstarted(unstarted).await);
                }
                break;
            }

            match self.process_message(message).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    if !matches!(err, DispatchError::Interrupted { .. }) {
                        for unstarted in pending {
                            self.return_unstarted(unstarted).await;
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(PollOutcome::Handled(reports))
    }

    /// Handles one received message from lease to resolution.
    async fn process_message(&self, message: QueueMessage) -> Result<JobReport, DispatchError> {
        let _in_flight = self.shutdown.in_flight_guard();
        let job_ref = message.job_reference(&self.config.job_id_attribute);
        let span = info_span!(
            "job",
            job_id = job_ref.as_deref().unwrap_or("-"),
            message_id = %message.message_id,
            worker = %self.config.worker_name,
        );
        let lease = Lease::acquire(message, self.config.lease_policy());
        self.handle(&lease, job_ref.map(JobId::new)).instrument(span).await
    }

    async fn handle(&self, lease: &Lease, job_id: Option<JobId>) -> Result<JobReport, DispatchError> {
        info!(delivery_count = lease.message().delivery_count, "message received");

        let Some(job_id) = job_id else {
            warn!("message carries no job id, deleting");
            let resolved = self.resolve_lease(lease, Disposition::Delete).await;
            return Ok(report(lease, None, Handling::Rejected, None, resolved));
        };

        let current = match self.status.get_status(&job_id).await {
            Ok(status) => status,
            Err(source) => return Err(self.abandon_on_status_error(lease, job_id, source).await),
        };
        match current {
            None => {
                warn!("job not found in status store, deleting message");
                let resolved = self.resolve_lease(lease, Disposition::Delete).await;
                return Ok(report(lease, Some(job_id), Handling::Rejected, None, resolved));
            }
            Some(status) if status.is_terminal() => {
                info!(status = %status, "skipping duplicate delivery");
                let resolved = self.resolve_lease(lease, Disposition::Delete).await;
                return Ok(report(
                    lease,
                    Some(job_id),
                    Handling::SkippedDuplicate(status),
                    None,
                    resolved,
                ));
            }
            Some(_) => {}
        }

        if let Err(source) = self.status.mark_status(&job_id, JobStatus::Running, None).await {
            return Err(self.abandon_on_status_error(lease, job_id, source).await);
        }

        let outcome = self.execute(lease, &job_id).await?;
        self.conclude(lease, job_id, outcome).await
    }

    /// Runs the job on its own task with the heartbeat alongside, and
    /// returns once both have stopped.
    async fn execute(&self, lease: &Lease, job_id: &JobId) -> Result<JobOutcome, DispatchError> {
        info!("job started");
        let heartbeat = lease.start_heartbeat(Arc::clone(&self.queue));
        let ctx = JobContext::new(
            job_id.clone(),
            lease.message(),
            self.config.worker_name.clone(),
            lease.view(),
        );
        let runner = Arc::clone(&self.runner);
        let mut task = AbortOnDropHandle::new(tokio::spawn(
            async move { runner.run(ctx).await }.instrument(Span::current()),
        ));

        let joined = tokio::select! {
            biased;
            joined = &mut task => joined,
            () = self.shutdown.reached(ShutdownSignal::Immediate) => {
                drop(task);
                drop(heartbeat);
                warn!(
                    extensions = lease.extensions(),
                    in_flight = self.shutdown.in_flight_count(),
                    "immediate shutdown, abandoning job and leaving its lease to expire"
                );
                return Err(DispatchError::Interrupted { job_id: job_id.clone() });
            }
        };

        if let Some(summary) = heartbeat.stop().await {
            debug!(extensions = summary.extensions, stopped_by = ?summary.stopped_by, "heartbeat stopped");
        }

        Ok(match joined {
            Ok(Ok(())) => JobOutcome::Succeeded,
            Ok(Err(err)) => JobOutcome::Failed(err),
            Err(join_err) => JobOutcome::Failed(crash_from_join(join_err)),
        })
    }

    /// Classifies the outcome, writes the status, and resolves the lease.
    async fn conclude(
        &self,
        lease: &Lease,
        job_id: JobId,
        outcome: JobOutcome,
    ) -> Result<JobReport, DispatchError> {
        let budget = RetryBudget::from_policy(self.queue.redrive_policy(), lease.message().delivery_count);
        let resolution = classify(&outcome, budget);

        if let Some(update) = &resolution.status {
            if let Err(source) = self
                .status
                .mark_status(&job_id, update.status, update.error_message.as_deref())
                .await
            {
                return Err(self.abandon_on_status_error(lease, job_id, source).await);
            }
        }

        let resolved = self.resolve_lease(lease, resolution.disposition).await;
        let error = match outcome {
            JobOutcome::Succeeded => None,
            JobOutcome::Failed(err) => Some(err),
        };
        log_resolution(&resolution, error.as_ref(), lease);

        if resolution.escalate {
            return Err(DispatchError::ExecutionCrashed {
                job_id,
                reason: error.map_or_else(String::new, |e| e.message),
            });
        }
        Ok(report(
            lease,
            Some(job_id),
            Handling::Ran(resolution.reason),
            error,
            resolved,
        ))
    }

    /// Deletes or releases (timeout 0) the message and marks the lease
    /// resolved. Failures are logged, never propagated: the lease may
    /// already belong to another worker.
    async fn resolve_lease(&self, lease: &Lease, disposition: Disposition) -> bool {
        let result = match disposition {
            Disposition::Delete => self.queue.delete(lease.message()).await,
            Disposition::Release => self.queue.release(lease.message(), Duration::ZERO).await,
        };
        lease.resolve();

        match result {
            Ok(()) => true,
            Err(err) => {
                if err.is_lease_expired() {
                    lease.mark_at_risk();
                }
                warn!(
                    error = %err,
                    disposition = ?disposition,
                    at_risk = lease.is_at_risk(),
                    "could not resolve lease, leaving the message to the queue"
                );
                false
            }
        }
    }

    async fn abandon_on_status_error(&self, lease: &Lease, job_id: JobId, source: StatusError) -> DispatchError {
        error!(error = %source, "status store failed, releasing message");
        self.resolve_lease(lease, Disposition::Release).await;
        DispatchError::StatusStore { job_id, source }
    }

    async fn return_unstarted(&self, message: QueueMessage) -> JobReport {
        let job_id = message.job_reference(&self.config.job_id_attribute).map(JobId::new);
        let lease = Lease::acquire(message, self.config.lease_policy());
        info!(message_id = %lease.message().message_id, "shutdown requested, returning unstarted message");
        let resolved = self.resolve_lease(&lease, Disposition::Release).await;
        report(&lease, job_id, Handling::Returned, None, resolved)
    }

    async fn backoff(&self, delay: Duration) {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = self.shutdown.reached(ShutdownSignal::Graceful) => {}
        }
    }

}

fn report(
    lease: &Lease,
    job_id: Option<JobId>,
    handling: Handling,
    error: Option<JobError>,
    lease_resolved: bool,
) -> JobReport {
    JobReport {
        message_id: lease.message().message_id.clone(),
        job_id,
        handling,
        error,
        lease_resolved,
        extensions: lease.extensions(),
        elapsed: lease.held_for(),
    }
}

fn log_resolution(resolution: &Resolution, error: Option<&JobError>, lease: &Lease) {
    let reason = resolution.reason.as_str();
    let elapsed_ms = u64::try_from(lease.held_for().as_millis()).unwrap_or(u64::MAX);
    let extensions = lease.extensions();
    let error = error.map(ToString::to_string);
    let error = error.as_deref();
    match resolution.reason {
        ResolutionReason::Succeeded => {
            info!(reason, elapsed_ms, extensions, "job resolved");
        }
        ResolutionReason::TransientRetry => {
            warn!(reason, elapsed_ms, extensions, error, "job released for retry");
        }
        ResolutionReason::ContentError | ResolutionReason::TransientExhausted => {
            warn!(reason, elapsed_ms, extensions, error, "job failed");
        }
        ResolutionReason::Crashed | ResolutionReason::Unclassified => {
            error!(reason, elapsed_ms, extensions, error, "job failed");
        }
    }
}

fn crash_from_join(err: JoinError) -> JobError {
    if !err.is_panic() {
        return JobError::crash("job task was cancelled");
    }
    let payload = err.into_panic();
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    JobError::crash(format!("job panicked: {text}"))
}
