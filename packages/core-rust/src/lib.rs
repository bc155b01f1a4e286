//! `workq` core: queue message model, job status, error taxonomy, and lease resolution rules.

pub mod classify;
pub mod error;
pub mod job;
pub mod lease;
pub mod message;

pub use classify::{
    classify, Disposition, JobOutcome, RedrivePolicy, Resolution, ResolutionReason, RetryBudget,
    StatusUpdate,
};
pub use error::{JobError, JobErrorKind};
pub use job::{JobId, JobStatus};
pub use lease::{ExtensionPlan, LeasePolicy, LeasePolicyError};
pub use message::{job_reference, AttributeValue, MessageId, QueueMessage, ReceiptHandle};
