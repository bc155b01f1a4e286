//! Error classification: maps a job outcome to lease and status handling.
//!
//! [`classify`] is a pure function over the outcome tag and the queue's retry
//! budget. It decides three things:
//!
//! 1. What happens to the message (`Disposition`): deleted for good, or
//!    released with a zero visibility timeout for immediate redelivery.
//! 2. Which status (if any) is written for the job.
//! 3. Whether the failure is escalated to the poll loop.

use std::fmt;

use crate::error::{JobError, JobErrorKind};
use crate::job::JobStatus;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// How a job's execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The runner returned normally.
    Succeeded,
    /// The runner raised an error, or its execution context died.
    Failed(JobError),
}

/// The queue's redrive policy: how many receives a message gets before the
/// queue dead-letters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    /// Computes the retry budget for a delivery with the given queue-reported
    /// receive count.
    #[must_use]
    pub fn budget_for(self, delivery_count: Option<u32>) -> RetryBudget {
        match delivery_count {
            Some(count) if count >= self.max_receive_count => RetryBudget::Exhausted,
            Some(_) => RetryBudget::Remaining,
            None => RetryBudget::Unknown,
        }
    }
}

/// Whether the queue will redeliver the message after this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// The queue will hand the message out again.
    Remaining,
    /// This was the last delivery the redrive policy allows.
    Exhausted,
    /// No redrive policy or no receive count; assume redelivery continues.
    Unknown,
}

impl RetryBudget {
    /// Derives the budget from an optional policy and receive count.
    #[must_use]
    pub fn from_policy(policy: Option<RedrivePolicy>, delivery_count: Option<u32>) -> Self {
        policy.map_or(RetryBudget::Unknown, |p| p.budget_for(delivery_count))
    }

    #[must_use]
    pub fn is_exhausted(self) -> bool {
        self == RetryBudget::Exhausted
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// What to do with the message once the job has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message permanently.
    Delete,
    /// Make the message visible again immediately (visibility timeout 0).
    Release,
}

/// Why a lease was resolved the way it was. Logged as `reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionReason {
    Succeeded,
    ContentError,
    TransientRetry,
    TransientExhausted,
    Crashed,
    Unclassified,
}

impl ResolutionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionReason::Succeeded => "succeeded",
            ResolutionReason::ContentError => "content_error",
            ResolutionReason::TransientRetry => "transient_retry",
            ResolutionReason::TransientExhausted => "transient_exhausted",
            ResolutionReason::Crashed => "crashed",
            ResolutionReason::Unclassified => "unclassified",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self == ResolutionReason::Succeeded
    }
}

impl fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status write requested by a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub error_message: Option<String>,
}

/// The classifier's decision for one job outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub reason: ResolutionReason,
    pub disposition: Disposition,
    /// `None` leaves the stored status untouched.
    pub status: Option<StatusUpdate>,
    /// Surface the failure to the poll loop after resolving the lease.
    pub escalate: bool,
}

// ---------------------------------------------------------------------------
// classify
// ---------------------------------------------------------------------------

/// Classifies a job outcome.
///
/// | outcome        | disposition | status                       | escalate |
/// |----------------|-------------|------------------------------|----------|
/// | success        | delete      | finished                     | no       |
/// | content        | delete      | failed + message             | no       |
/// | transient      | release     | untouched, failed if final   | no       |
/// | crash          | release     | failed + message/detail      | yes      |
/// | unclassified   | delete      | failed + message             | no       |
#[must_use]
pub fn classify(outcome: &JobOutcome, budget: RetryBudget) -> Resolution {
    let err = match outcome {
        JobOutcome::Succeeded => {
            return Resolution {
                reason: ResolutionReason::Succeeded,
                disposition: Disposition::Delete,
                status: Some(StatusUpdate {
                    status: JobStatus::Finished,
                    error_message: None,
                }),
                escalate: false,
            };
        }
        JobOutcome::Failed(err) => err,
    };

    let failed = Some(StatusUpdate {
        status: JobStatus::Failed,
        error_message: Some(err.status_message()),
    });

    match err.kind {
        JobErrorKind::Content => Resolution {
            reason: ResolutionReason::ContentError,
            disposition: Disposition::Delete,
            status: failed,
            escalate: false,
        },
        JobErrorKind::Transient if budget.is_exhausted() => Resolution {
            reason: ResolutionReason::TransientExhausted,
            disposition: Disposition::Release,
            status: failed,
            escalate: false,
        },
        JobErrorKind::Transient => Resolution {
            reason: ResolutionReason::TransientRetry,
            disposition: Disposition::Release,
            status: None,
            escalate: false,
        },
        JobErrorKind::Crash => Resolution {
            reason: ResolutionReason::Crashed,
            disposition: Disposition::Release,
            status: failed,
            escalate: true,
        },
        JobErrorKind::Unclassified => Resolution {
            reason: ResolutionReason::Unclassified,
            disposition: Disposition::Delete,
            status: failed,
            escalate: false,
        },
    }
}
