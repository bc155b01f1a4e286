//! Lease on one received message, and the heartbeat that keeps it alive.
//!
//! A [`Lease`] is created when a message is received and is exclusively
//! owned by the dispatcher for that message's lifecycle. While the job runs,
//! a [`Heartbeat`] task extends the message's visibility timeout on a fixed
//! interval measured from *now*, so load-induced delays never accumulate
//! into a missed deadline.
//!
//! The heartbeat is the only writer of the visibility deadline. The job gets
//! a read-only [`LeaseView`].
//!
//! State machine: `Acquired -> Running <-> Extending -> Resolved`

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn, Instrument};
use workq_core::{ExtensionPlan, LeasePolicy, MessageId, QueueMessage};

use crate::queue::QueueClient;

/// Shortest wait before retrying a failed extension.
const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// LeaseState
// ---------------------------------------------------------------------------

/// Lifecycle state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Message received; job not started yet.
    Acquired,
    /// Job running; heartbeat idle between ticks.
    Running,
    /// Heartbeat is waiting on an `extend` call.
    Extending,
    /// Deleted or released. Terminal.
    Resolved,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LeaseShared {
    deadline: ArcSwap<Instant>,
    state: ArcSwap<LeaseState>,
    at_risk: AtomicBool,
    extensions: AtomicU32,
}

impl LeaseShared {
    fn set_state(&self, state: LeaseState) {
        self.state.store(Arc::new(state));
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// The dispatcher's view of one in-flight message.
#[derive(Debug)]
pub struct Lease {
    message: Arc<QueueMessage>,
    policy: LeasePolicy,
    acquired_at: Instant,
    shared: Arc<LeaseShared>,
}

impl Lease {
    /// Takes ownership of a freshly received message. The deadline starts at
    /// the initial visibility timeout from now.
    #[must_use]
    pub fn acquire(message: QueueMessage, policy: LeasePolicy) -> Self {
        let acquired_at = Instant::now();
        Self {
            message: Arc::new(message),
            policy,
            acquired_at,
            shared: Arc::new(LeaseShared {
                deadline: ArcSwap::from_pointee(acquired_at + policy.visibility_timeout),
                state: ArcSwap::from_pointee(LeaseState::Acquired),
                at_risk: AtomicBool::new(false),
                extensions: AtomicU32::new(0),
            }),
        }
    }

    #[must_use]
    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    #[must_use]
    pub fn state(&self) -> LeaseState {
        **self.shared.state.load()
    }

    /// Absolute time after which the queue may redeliver the message.
    #[must_use]
    pub fn visibility_deadline(&self) -> Instant {
        **self.shared.deadline.load()
    }

    /// Set when an extension failed or the ceiling was hit: the queue may
    /// already have handed the message to someone else. Cleared again by a
    /// later successful extension.
    #[must_use]
    pub fn is_at_risk(&self) -> bool {
        self.shared.at_risk.load(Ordering::Acquire)
    }

    /// Number of successful extensions so far.
    #[must_use]
    pub fn extensions(&self) -> u32 {
        self.shared.extensions.load(Ordering::Acquire)
    }

    /// How long the lease has been held.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Read-only handle for the running job.
    #[must_use]
    pub fn view(&self) -> LeaseView {
        LeaseView {
            message_id: self.message.message_id.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Moves the lease to `Running` and starts its heartbeat task.
    ///
    /// The returned [`Heartbeat`] must be stopped once the job's execution
    /// context has terminated; dropping it aborts the task.
    pub fn start_heartbeat<Q: QueueClient>(&self, queue: Arc<Q>) -> Heartbeat {
        self.shared.set_state(LeaseState::Running);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = heartbeat_loop(
            queue,
            Arc::clone(&self.message),
            self.policy,
            self.acquired_at,
            Arc::clone(&self.shared),
            stop_rx,
        )
        .instrument(tracing::Span::current());

        Heartbeat {
            stop_tx: Some(stop_tx),
            handle: Some(AbortOnDropHandle::new(tokio::spawn(task))),
        }
    }

    /// Flags the lease as possibly lost.
    pub fn mark_at_risk(&self) {
        self.shared.at_risk.store(true, Ordering::Release);
    }

    /// Marks the lease resolved. Called once, after delete or release.
    pub fn resolve(&self) {
        self.shared.set_state(LeaseState::Resolved);
    }
}

// ---------------------------------------------------------------------------
// LeaseView
// ---------------------------------------------------------------------------

/// Read access to a lease's deadline and health, handed to the job runner.
#[derive(Debug, Clone)]
pub struct LeaseView {
    message_id: MessageId,
    shared: Arc<LeaseShared>,
}

impl LeaseView {
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    #[must_use]
    pub fn visibility_deadline(&self) -> Instant {
        **self.shared.deadline.load()
    }

    /// Time left before the current visibility window closes.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.visibility_deadline()
            .saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_at_risk(&self) -> bool {
        self.shared.at_risk.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Why a heartbeat stopped extending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStop {
    /// Stopped by the dispatcher after the job ended.
    JobFinished,
    /// The lease reached `max_visibility_timeout`.
    CeilingReached,
    /// The queue reported the lease as expired.
    LeaseLost,
}

/// Final report of a heartbeat task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSummary {
    pub extensions: u32,
    pub stopped_by: HeartbeatStop,
}

/// Handle to a running heartbeat task.
pub struct Heartbeat {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<AbortOnDropHandle<HeartbeatSummary>>,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Heartbeat {
    /// Stops the heartbeat and waits for the task to exit.
    ///
    /// An extension call already in flight completes first, so no extension
    /// can land after this returns.
    pub async fn stop(mut self) -> Option<HeartbeatSummary> {
        if let Some(tx) = self.stop_tx.take() {
            // The task may have already exited on its own.
            let _ = tx.send(());
        }
        let handle = self.handle.take()?;
        match handle.await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(error = %err, "heartbeat task ended abnormally");
                None
            }
        }
    }
}

async fn heartbeat_loop<Q: QueueClient>(
    queue: Arc<Q>,
    message: Arc<QueueMessage>,
    policy: LeasePolicy,
    acquired_at: Instant,
    shared: Arc<LeaseShared>,
    mut stop_rx: oneshot::Receiver<()>,
) -> HeartbeatSummary {
    let summary = |stopped_by| HeartbeatSummary {
        extensions: shared.extensions.load(Ordering::Acquire),
        stopped_by,
    };

    let mut delay = policy.heartbeat_interval;
    loop {
        let next_tick = Instant::now() + delay;
        tokio::select! {
            biased;
            _ = &mut stop_rx => return summary(HeartbeatStop::JobFinished),
            () = tokio::time::sleep_until(next_tick) => {}
        }

        let now = Instant::now();
        if now >= **shared.deadline.load() {
            shared.at_risk.store(true, Ordering::Release);
            warn!(message_id = %message.message_id, "heartbeat fired after the visibility deadline");
        }

        let window = match policy.plan_extension(now - acquired_at) {
            ExtensionPlan::Extend(window) => window,
            ExtensionPlan::CeilingReached => {
                shared.at_risk.store(true, Ordering::Release);
                warn!(
                    message_id = %message.message_id,
                    held_secs = (now - acquired_at).as_secs(),
                    "lease ceiling reached, letting the lease lapse"
                );
                return summary(HeartbeatStop::CeilingReached);
            }
        };

        shared.set_state(LeaseState::Extending);
        let result = queue.extend(&message, window).await;
        shared.set_state(LeaseState::Running);

        match result {
            Ok(()) => {
                shared.deadline.store(Arc::new(now + window));
                let count = shared.extensions.fetch_add(1, Ordering::AcqRel) + 1;
                let recovered = shared.at_risk.swap(false, Ordering::AcqRel);
                info!(
                    message_id = %message.message_id,
                    timeout_secs = window.as_secs(),
                    extensions = count,
                    recovered,
                    "heartbeat extended lease"
                );
                delay = policy.heartbeat_interval;
            }
            Err(err) if err.is_lease_expired() => {
                shared.at_risk.store(true, Ordering::Release);
                warn!(
                    message_id = %message.message_id,
                    error = %err,
                    "lease lost, heartbeat stopping; job continues"
                );
                return summary(HeartbeatStop::LeaseLost);
            }
            Err(err) => {
                shared.at_risk.store(true, Ordering::Release);
                let remaining = shared.deadline.load().saturating_duration_since(Instant::now());
                delay = retry_delay(policy.heartbeat_interval, remaining);
                warn!(
                    message_id = %message.message_id,
                    error = %err,
                    remaining_secs = remaining.as_secs(),
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "lease extension failed, retrying before the deadline"
                );
            }
        }
    }
}

/// Wait before retrying a failed extension: half of what is left of the
/// current window, never longer than the regular interval.
fn retry_delay(interval: Duration, remaining: Duration) -> Duration {
    (remaining / 2).max(MIN_RETRY_DELAY).min(interval)
}
