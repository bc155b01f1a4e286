//! Job status reporting boundary.
//!
//! Persistence of job status lives outside the dispatcher. The dispatcher
//! reads the current status to short-circuit duplicate deliveries and writes
//! status transitions as a job runs and resolves.

use async_trait::async_trait;
use dashmap::DashMap;
use workq_core::{JobId, JobStatus};

/// Errors from the status store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    /// The store could not be reached. The dispatcher treats this as fatal.
    #[error("status store unavailable: {0}")]
    Unavailable(String),
    /// The store has no record for the job.
    #[error("job {0} not found")]
    NotFound(JobId),
}

/// Stored view of a job's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub status: JobStatus,
    pub error_message: Option<String>,
}

/// Records job status transitions.
///
/// Implementations must be idempotent: writing the same status twice leaves
/// the same record. The first error message recorded for a job is kept; a
/// later failure write does not overwrite it, so a job's own diagnosis
/// survives the dispatcher's defensive crash marking.
#[async_trait]
pub trait StatusReporter: Send + Sync + 'static {
    /// Writes `status` for `job_id`, attaching `error_message` if the record
    /// does not already carry one.
    async fn mark_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), StatusError>;

    /// Reads the current status. `Ok(None)` means the job is unknown.
    async fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, StatusError>;
}

// ---------------------------------------------------------------------------
// InMemoryStatusStore
// ---------------------------------------------------------------------------

/// Status store backed by a concurrent map, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    records: DashMap<JobId, JobRecord>,
    history: DashMap<JobId, Vec<JobStatus>>,
}

impl InMemoryStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job in the `ready` state.
    pub fn insert_ready(&self, job_id: impl Into<JobId>) {
        self.insert(job_id.into(), JobStatus::Ready);
    }

    /// Registers (or overwrites) a job with the given status.
    pub fn insert(&self, job_id: JobId, status: JobStatus) {
        self.history.insert(job_id.clone(), vec![status]);
        self.records.insert(
            job_id,
            JobRecord {
                status,
                error_message: None,
            },
        );
    }

    /// Returns the full stored record.
    #[must_use]
    pub fn record(&self, job_id: &JobId) -> Option<JobRecord> {
        self.records.get(job_id).map(|r| r.clone())
    }

    /// Every status written for the job, oldest first.
    #[must_use]
    pub fn history(&self, job_id: &JobId) -> Vec<JobStatus> {
        self.history
            .get(job_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusReporter for InMemoryStatusStore {
    async fn mark_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), StatusError> {
        let mut record = self
            .records
            .get_mut(job_id)
            .ok_or_else(|| StatusError::NotFound(job_id.clone()))?;
        record.status = status;
        if record.error_message.is_none() {
            record.error_message = error_message.map(str::to_string);
        }
        drop(record);

        self.history.entry(job_id.clone()).or_default().push(status);
        Ok(())
    }

    async fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, StatusError> {
        Ok(self.records.get(job_id).map(|r| r.status))
    }
}
