//! `workq` worker: lease/heartbeat work dispatcher over a visibility-timeout queue.

pub mod config;
pub mod dispatcher;
pub mod lease;
pub mod queue;
pub mod runner;
pub mod shutdown;
pub mod signals;
pub mod status;
pub mod telemetry;

pub use config::{ConfigError, DispatcherConfig};
pub use dispatcher::{DispatchError, Handling, JobReport, PollOutcome, RunExit, WorkDispatcher};
pub use lease::{Heartbeat, HeartbeatStop, HeartbeatSummary, Lease, LeaseState, LeaseView};
pub use queue::{InMemoryQueue, QueueClient, QueueError};
pub use runner::{runner_fn, CommandRunner, FnRunner, JobContext, JobRunner, RunnerRouter};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController, ShutdownSignal};
pub use signals::spawn_signal_listener;
pub use status::{InMemoryStatusStore, JobRecord, StatusError, StatusReporter};
pub use telemetry::{init_tracing, LogFormat};
pub use workq_core::LeasePolicy;
