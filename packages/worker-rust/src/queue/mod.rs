//! Queue client boundary.
//!
//! The dispatcher talks to the visibility-timeout queue only through
//! [`QueueClient`]. Implementations: managed cloud queues (out of tree) and
//! [`memory::InMemoryQueue`] for tests and local runs.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use workq_core::{QueueMessage, ReceiptHandle, RedrivePolicy};

pub use memory::InMemoryQueue;

/// Errors returned by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The delivery's lease already expired server-side; another worker may
    /// own the message now. Never retried.
    #[error("lease expired for receipt {receipt}")]
    LeaseExpired { receipt: ReceiptHandle },
    /// The call failed but the queue is reachable; a later call may succeed.
    #[error("transient queue error: {0}")]
    Transient(String),
    /// The queue could not be reached at all.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    #[must_use]
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, QueueError::LeaseExpired { .. })
    }
}

/// Operations the dispatcher needs from a visibility-timeout queue.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    /// Waits up to `max_wait` for messages and returns at most `max_messages`
    /// of them, each already hidden for `visibility_timeout`.
    ///
    /// Returning an empty list is not an error.
    async fn receive(
        &self,
        max_wait: Duration,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Resets the delivery's visibility timeout to `timeout` from now.
    ///
    /// Fails with [`QueueError::LeaseExpired`] when the delivery is no longer
    /// the current one.
    async fn extend(&self, message: &QueueMessage, timeout: Duration) -> Result<(), QueueError>;

    /// Removes the message permanently. Deleting an already-deleted message
    /// succeeds.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Sets the visibility timeout to `timeout`; zero makes the message
    /// immediately eligible for redelivery.
    async fn release(&self, message: &QueueMessage, timeout: Duration) -> Result<(), QueueError>;

    /// The queue-side redrive policy, if one is configured.
    fn redrive_policy(&self) -> Option<RedrivePolicy> {
        None
    }
}
