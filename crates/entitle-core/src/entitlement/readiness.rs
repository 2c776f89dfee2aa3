//! Readiness watchdog
//!
//! Waits on a resolution without ever cancelling it. After a warning delay
//! the user is told it is taking longer than expected; after the hard
//! timeout collaborators are told it is unresolvable.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EntitlementConfig;
use crate::events::Emitter;

pub const SLOW_MESSAGE: &str = "Setting up chat is taking longer than expected...";
pub const TIMEOUT_MESSAGE: &str =
    "Chat took too long to get ready. Please review the guidance in the Chat view.";

/// Receives user-facing readiness messages
pub trait ReadinessReporter: Send + Sync {
    fn progress(&self, message: &str);
    fn warning(&self, message: &str);
}

/// Reporter that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ReadinessReporter for LogReporter {
    fn progress(&self, message: &str) {
        log::info!("[readiness] {}", message);
    }

    fn warning(&self, message: &str) {
        log::warn!("[readiness] {}", message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness<T> {
    Ready(T),
    /// The hard timeout passed; the work keeps running in the background
    TimedOut,
}

pub struct ReadinessWatchdog {
    warning_after: Duration,
    timeout_after: Duration,
    reporter: Arc<dyn ReadinessReporter>,
    unresolvable: Arc<Emitter>,
}

impl ReadinessWatchdog {
    pub fn new(
        config: &EntitlementConfig,
        reporter: Arc<dyn ReadinessReporter>,
        unresolvable: Arc<Emitter>,
    ) -> Self {
        Self::with_durations(config.ready_warning(), config.ready_timeout(), reporter, unresolvable)
    }

    pub fn with_durations(
        warning_after: Duration,
        timeout_after: Duration,
        reporter: Arc<dyn ReadinessReporter>,
        unresolvable: Arc<Emitter>,
    ) -> Self {
        Self {
            warning_after,
            timeout_after: timeout_after.max(warning_after),
            reporter,
            unresolvable,
        }
    }

    /// Spawn `work` and wait for it under the watchdog
    pub async fn when_ready<F>(&self, work: F) -> Readiness<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let started = tokio::time::Instant::now();
        let mut handle = tokio::spawn(work);

        let warning = tokio::time::sleep_until(started + self.warning_after);
        tokio::pin!(warning);
        let timeout = tokio::time::sleep_until(started + self.timeout_after);
        tokio::pin!(timeout);
        let mut warned = false;

        loop {
            tokio::select! {
                joined = &mut handle => {
                    return match joined {
                        Ok(output) => Readiness::Ready(output),
                        Err(e) => {
                            log::error!("[readiness] Resolution task failed: {}", e);
                            self.give_up(started);
                            Readiness::TimedOut
                        }
                    };
                }
                _ = &mut warning, if !warned => {
                    warned = true;
                    self.reporter.progress(SLOW_MESSAGE);
                }
                _ = &mut timeout => {
                    self.give_up(started);
                    return Readiness::TimedOut;
                }
            }
        }
    }

    fn give_up(&self, started: tokio::time::Instant) {
        log::warn!(
            "[readiness] Chat setup did not become ready after {}ms",
            started.elapsed().as_millis()
        );
        self.reporter.warning(TIMEOUT_MESSAGE);
        self.unresolvable.fire();
    }
}

impl std::fmt::Debug for ReadinessWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessWatchdog")
            .field("warning_after", &self.warning_after)
            .field("timeout_after", &self.timeout_after)
            .finish()
    }
}
