//! Two-level shutdown controller with in-flight job tracking.
//!
//! Uses `ArcSwap` for lock-free health state transitions, a `watch` channel
//! carrying the shutdown level, and an atomic counter with RAII guards for
//! in-flight job tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Worker health state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Polling -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Worker is initializing (not yet polling).
    Starting,
    /// Worker is polling the queue and running jobs.
    Polling,
    /// Shutdown requested; the in-flight job finishes, no new receives.
    Draining,
    /// Poll loop has exited.
    Stopped,
}

/// Requested shutdown level. Only ever escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownSignal {
    /// Keep running.
    None,
    /// Stop receiving; finish and resolve the in-flight job, then exit.
    Graceful,
    /// Exit now; the in-flight lease is left to lapse.
    Immediate,
}

/// Coordinates shutdown between the signal listener and the dispatcher.
///
/// 1. `health_state()` reports what the worker is doing
/// 2. The dispatcher checks `signal()` between messages
/// 3. `trigger_shutdown()` moves to Draining; `trigger_immediate()` escalates
/// 4. `set_stopped()` once the poll loop has returned
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<ShutdownSignal>,
    in_flight: Arc<AtomicU64>,
    health_state: ArcSwap<HealthState>,
}

impl ShutdownController {
    /// Creates a new shutdown controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ShutdownSignal::None);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    /// Transitions to `Polling` unless shutdown was already requested.
    pub fn set_polling(&self) {
        if self.signal() == ShutdownSignal::None {
            self.health_state.store(Arc::new(HealthState::Polling));
        }
    }

    /// Transitions to `Stopped`.
    pub fn set_stopped(&self) {
        self.health_state.store(Arc::new(HealthState::Stopped));
    }

    /// Returns a receiver notified on every shutdown level change.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<ShutdownSignal> {
        self.shutdown_signal.subscribe()
    }

    /// Requests graceful shutdown: no new receives, the in-flight job
    /// finishes and its lease is resolved.
    pub fn trigger_shutdown(&self) {
        self.escalate(ShutdownSignal::Graceful);
    }

    /// Requests immediate exit without waiting for the in-flight job.
    pub fn trigger_immediate(&self) {
        self.escalate(ShutdownSignal::Immediate);
    }

    fn escalate(&self, level: ShutdownSignal) {
        let raised = self.shutdown_signal.send_if_modified(|current| {
            if *current < level {
                *current = level;
                true
            } else {
                false
            }
        });
        if raised && self.health_state() != HealthState::Stopped {
            self.health_state.store(Arc::new(HealthState::Draining));
        }
    }

    /// Current shutdown level.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        *self.shutdown_signal.borrow()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.signal() != ShutdownSignal::None
    }

    /// Resolves once the shutdown level reaches `level`.
    pub async fn reached(&self, level: ShutdownSignal) {
        let mut rx = self.shutdown_receiver();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|current| *current >= level).await;
    }

    /// Returns the current health state.
    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Creates an RAII guard that tracks an in-flight job.
    ///
    /// The counter is decremented when the guard is dropped, even if the
    /// dispatcher unwinds.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Returns the current number of in-flight jobs.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_starting() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        assert_eq!(controller.signal(), ShutdownSignal::None);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn health_state_transitions_starting_polling_draining() {
        let controller = ShutdownController::new();

        controller.set_polling();
        assert_eq!(controller.health_state(), HealthState::Polling);

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert_eq!(controller.signal(), ShutdownSignal::Graceful);

        // Draining is sticky.
        controller.set_polling();
        assert_eq!(controller.health_state(), HealthState::Draining);
    }

    #[test]
    fn signal_only_escalates() {
        let controller = ShutdownController::new();
        controller.trigger_immediate();
        controller.trigger_shutdown();
        assert_eq!(controller.signal(), ShutdownSignal::Immediate);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn in_flight_guard_increments_and_decrements() {
        let controller = ShutdownController::new();

        let guard1 = controller.in_flight_guard();
        let guard2 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(guard1);
        assert_eq!(controller.in_flight_count(), 1);

        drop(guard2);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_receiver_notified() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert_eq!(*rx.borrow(), ShutdownSignal::None);

        controller.trigger_shutdown();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn reached_waits_for_requested_level() {
        let controller = Arc::new(ShutdownController::new());
        controller.trigger_shutdown();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.reached(ShutdownSignal::Immediate).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        controller.trigger_immediate();
        waiter.await.unwrap();

        // Already reached: returns at once.
        controller.reached(ShutdownSignal::Graceful).await;
    }
}
