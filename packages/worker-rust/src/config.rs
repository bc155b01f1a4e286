//! Dispatcher configuration.

use std::ops::RangeInclusive;
use std::time::Duration;

use workq_core::{LeasePolicy, LeasePolicyError};

/// Batch sizes a single receive may ask for.
pub const MAX_MESSAGES_RANGE: RangeInclusive<usize> = 1..=10;

/// Configuration for one [`WorkDispatcher`](crate::dispatcher::WorkDispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name attached to every log line and handed to runners.
    pub worker_name: String,
    /// Long-poll bound for one receive.
    pub wait_time: Duration,
    /// Window granted on receive and on every extension.
    pub visibility_timeout: Duration,
    /// Delay between heartbeats. Strictly less than `visibility_timeout`.
    pub heartbeat_interval: Duration,
    /// Ceiling on how long one lease may be held.
    pub max_visibility_timeout: Duration,
    /// Sleep after a receive that returned nothing.
    pub empty_queue_backoff: Duration,
    /// Sleep after a receive that failed.
    pub queue_error_backoff: Duration,
    /// Messages requested per receive.
    pub max_messages: usize,
    /// Message attribute carrying the job id. Falls back to the body.
    pub job_id_attribute: String,
    /// Stop the poll loop after the first empty receive.
    pub exit_when_idle: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let lease = LeasePolicy::default();
        Self {
            worker_name: "workq-worker".to_string(),
            wait_time: Duration::from_secs(10),
            visibility_timeout: lease.visibility_timeout,
            heartbeat_interval: lease.heartbeat_interval,
            max_visibility_timeout: lease.max_visibility_timeout,
            empty_queue_backoff: Duration::from_secs(1),
            queue_error_backoff: Duration::from_secs(5),
            max_messages: 1,
            job_id_attribute: "job_id".to_string(),
            exit_when_idle: false,
        }
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Lease(#[from] LeasePolicyError),
    #[error("max_messages must be within {min}..={max}, got {value}")]
    MaxMessages { value: usize, min: usize, max: usize },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

impl DispatcherConfig {
    /// Lease timing derived from this configuration.
    #[must_use]
    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            visibility_timeout: self.visibility_timeout,
            heartbeat_interval: self.heartbeat_interval,
            max_visibility_timeout: self.max_visibility_timeout,
        }
    }

    /// Checks the configuration before the dispatcher starts.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an invalid lease policy, an out-of-range
    /// batch size, or an empty worker name or job id attribute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lease_policy().validate()?;
        if !MAX_MESSAGES_RANGE.contains(&self.max_messages) {
            return Err(ConfigError::MaxMessages {
                value: self.max_messages,
                min: *MAX_MESSAGES_RANGE.start(),
                max: *MAX_MESSAGES_RANGE.end(),
            });
        }
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::Empty { field: "worker_name" });
        }
        if self.job_id_attribute.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "job_id_attribute",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_config_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.worker_name, "workq-worker");
        assert_eq!(config.wait_time, Duration::from_secs(10));
        assert_eq!(config.visibility_timeout, Duration::from_secs(600));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(300));
        assert_eq!(config.max_visibility_timeout, Duration::from_secs(4 * 3600));
        assert_eq!(config.empty_queue_backoff, Duration::from_secs(1));
        assert_eq!(config.max_messages, 1);
        assert_eq!(config.job_id_attribute, "job_id");
        assert!(!config.exit_when_idle);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn heartbeat_must_beat_the_timeout() {
        let config = DispatcherConfig {
            heartbeat_interval: Duration::from_secs(600),
            ..DispatcherConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Lease(LeasePolicyError::HeartbeatTooSlow { .. }))
        ));
    }

    #[test]
    fn batch_size_is_bounded() {
        for max_messages in [0, 11] {
            let config = DispatcherConfig {
                max_messages,
                ..DispatcherConfig::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::MaxMessages { .. })));
        }
    }

    #[test]
    fn blank_job_id_attribute_is_rejected() {
        let config = DispatcherConfig {
            job_id_attribute: " ".to_string(),
            ..DispatcherConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Empty {
                field: "job_id_attribute"
            })
        );
    }
}
