//! Lease timing rules.
//!
//! The heartbeat loop in the worker is a thin async shell around
//! [`LeasePolicy::plan_extension`]: every tick it asks the policy how long
//! the next visibility window should be, given how long the lease has
//! already been held.
//!
//! # Timing invariant
//!
//! Ticks are scheduled `heartbeat_interval` after the previous tick's
//! extension completed (relative to *now*, not to a nominal schedule), and
//! every granted window is `visibility_timeout > heartbeat_interval`, so each
//! tick lands strictly before the deadline the previous extension set. The
//! one exception is the final window clamped by `max_visibility_timeout`,
//! after which the policy answers [`ExtensionPlan::CeilingReached`] and the
//! lease is left to lapse.

use std::time::Duration;

/// Timing configuration for one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Visibility window granted on receive and on every extension.
    pub visibility_timeout: Duration,
    /// Delay between heartbeats. Must be strictly less than
    /// `visibility_timeout`.
    pub heartbeat_interval: Duration,
    /// Ceiling on total held time. Extension stops once reached.
    pub max_visibility_timeout: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(300),
            max_visibility_timeout: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// Rejected lease policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeasePolicyError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("heartbeat interval ({interval:?}) must be shorter than the visibility timeout ({timeout:?})")]
    HeartbeatTooSlow { interval: Duration, timeout: Duration },
    #[error("visibility timeout ({timeout:?}) exceeds the lease ceiling ({ceiling:?})")]
    TimeoutAboveCeiling { timeout: Duration, ceiling: Duration },
}

/// What the heartbeat should do on its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionPlan {
    /// Extend the visibility timeout to this window, measured from now.
    Extend(Duration),
    /// The lease has been held for `max_visibility_timeout`; stop extending.
    CeilingReached,
}

impl LeasePolicy {
    /// Builds a policy whose heartbeat fires at half the visibility timeout.
    #[must_use]
    pub fn with_timeout(visibility_timeout: Duration, max_visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            heartbeat_interval: visibility_timeout / 2,
            max_visibility_timeout,
        }
    }

    /// Checks the ordering constraints between the three durations.
    ///
    /// # Errors
    ///
    /// Returns `LeasePolicyError` when a duration is zero, when the heartbeat
    /// would not fire before the window closes, or when a single window is
    /// larger than the ceiling.
    pub fn validate(&self) -> Result<(), LeasePolicyError> {
        if self.visibility_timeout.is_zero() {
            return Err(LeasePolicyError::Zero {
                field: "visibility_timeout",
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(LeasePolicyError::Zero {
                field: "heartbeat_interval",
            });
        }
        if self.max_visibility_timeout.is_zero() {
            return Err(LeasePolicyError::Zero {
                field: "max_visibility_timeout",
            });
        }
        if self.heartbeat_interval >= self.visibility_timeout {
            return Err(LeasePolicyError::HeartbeatTooSlow {
                interval: self.heartbeat_interval,
                timeout: self.visibility_timeout,
            });
        }
        if self.visibility_timeout > self.max_visibility_timeout {
            return Err(LeasePolicyError::TimeoutAboveCeiling {
                timeout: self.visibility_timeout,
                ceiling: self.max_visibility_timeout,
            });
        }
        Ok(())
    }

    /// Decides the next extension for a lease that has been held for `held`.
    ///
    /// The granted window never pushes total held time past
    /// `max_visibility_timeout`.
    #[must_use]
    pub fn plan_extension(&self, held: Duration) -> ExtensionPlan {
        let remaining = self.max_visibility_timeout.saturating_sub(held);
        // Sub-second windows are not representable by second-granular queues.
        if remaining < Duration::from_secs(1) {
            return ExtensionPlan::CeilingReached;
        }
        ExtensionPlan::Extend(self.visibility_timeout.min(remaining))
    }
}
