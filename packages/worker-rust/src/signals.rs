//! OS signal handling.
//!
//! The first SIGINT/SIGTERM requests graceful shutdown: the dispatcher stops
//! receiving, lets the in-flight job finish and resolves its lease. A second
//! signal escalates to immediate exit.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::shutdown::ShutdownController;

/// Source of shutdown signals, yielding the signal name.
#[async_trait]
pub(crate) trait SignalSource: Send + 'static {
    /// Next signal, or `None` once the source is closed.
    async fn next(&mut self) -> Option<&'static str>;
}

/// SIGINT and SIGTERM on unix, Ctrl+C elsewhere.
pub(crate) struct OsSignals {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl OsSignals {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }
}

#[async_trait]
impl SignalSource for OsSignals {
    #[cfg(unix)]
    async fn next(&mut self) -> Option<&'static str> {
        tokio::select! {
            s = self.sigint.recv() => s.map(|()| "SIGINT"),
            s = self.sigterm.recv() => s.map(|()| "SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|()| "ctrl-c")
    }
}

/// Installs the signal handlers and spawns the listener task.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be registered.
pub fn spawn_signal_listener(controller: Arc<ShutdownController>) -> std::io::Result<JoinHandle<()>> {
    let signals = OsSignals::install()?;
    Ok(tokio::spawn(listen(signals, controller)))
}

pub(crate) async fn listen<S: SignalSource>(mut signals: S, controller: Arc<ShutdownController>) {
    let Some(signal) = signals.next().await else {
        return;
    };
    info!(signal, "shutdown requested, finishing the in-flight job");
    controller.trigger_shutdown();

    let Some(signal) = signals.next().await else {
        return;
    };
    warn!(signal, "second signal, exiting without waiting for the in-flight job");
    controller.trigger_immediate();
}
