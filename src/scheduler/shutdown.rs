//! Graceful shutdown
//!
//! Shutdown runs as a fixed sequence of phases:
//! `idle -> draining -> cleaning-locks -> closing-resources -> exited`.
//! Every step is best effort; a failing step is recorded and the next one
//! still runs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::Scheduler;
use crate::Result;

/// Where the shutdown sequence is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPhase {
    /// Not shutting down
    Idle,
    /// Triggers stopped, waiting for running jobs
    Draining,
    /// Removing lock files owned by this process
    CleaningLocks,
    /// Closing shared resources
    ClosingResources,
    /// Done
    Exited,
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::CleaningLocks => "cleaning-locks",
            Self::ClosingResources => "closing-resources",
            Self::Exited => "exited",
        })
    }
}

/// What started the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// An OS signal, by name
    Signal(&'static str),
    /// A panic or other unrecoverable error
    Fatal(String),
    /// Asked for programmatically
    Requested,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {name}"),
            Self::Fatal(reason) => write!(f, "fatal error: {reason}"),
            Self::Requested => f.write_str("shutdown request"),
        }
    }
}

/// A long-lived handle closed during shutdown, such as a database pool
#[async_trait]
pub trait SharedResource: Send + Sync {
    /// Name used in logs and the report
    fn name(&self) -> &str;

    /// Release the resource
    async fn close(&self) -> Result<()>;
}

/// What a completed shutdown did
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Trigger description
    pub trigger: String,
    /// Jobs that exited within the grace period
    pub exited: Vec<String>,
    /// Jobs force-killed at the deadline
    pub killed: Vec<String>,
    /// Lock files removed
    pub locks_removed: usize,
    /// Resources closed cleanly
    pub resources_closed: Vec<String>,
    /// Steps that failed, in order
    pub failures: Vec<String>,
}

/// Runs the shutdown sequence exactly once
pub struct ShutdownCoordinator {
    scheduler: Arc<Scheduler>,
    resources: Vec<Arc<dyn SharedResource>>,
    grace: Duration,
    phase: watch::Sender<ShutdownPhase>,
    repeat_logged: AtomicBool,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("phase", &self.phase())
            .field("grace", &self.grace)
            .field("resources", &self.resources.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator waiting up to `grace` for running jobs
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>, grace: Duration) -> Self {
        Self {
            scheduler,
            resources: Vec::new(),
            grace,
            phase: watch::Sender::new(ShutdownPhase::Idle),
            repeat_logged: AtomicBool::new(false),
        }
    }

    /// Close `resource` as the last step of shutdown
    #[must_use]
    pub fn with_resource(mut self, resource: Arc<dyn SharedResource>) -> Self {
        self.resources.push(resource);
        self
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Whether shutdown has started
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Idle
    }

    /// Run the shutdown sequence.
    ///
    /// Only the first call does anything; later calls return `None`, and the
    /// first of them is logged.
    pub async fn shutdown(&self, trigger: ShutdownTrigger) -> Option<ShutdownReport> {
        let first = self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Idle {
                *phase = ShutdownPhase::Draining;
                true
            } else {
                false
            }
        });
        if !first {
            if !self.repeat_logged.swap(true, Ordering::SeqCst) {
                info!(%trigger, phase = %self.phase(), "Shutdown already in progress, ignoring");
            }
            return None;
        }

        match &trigger {
            ShutdownTrigger::Fatal(reason) => error!(reason = %reason, "Fatal error, shutting down"),
            _ => info!(%trigger, grace_ms = self.grace.as_millis(), "Shutting down"),
        }
        let mut report = ShutdownReport {
            trigger: trigger.to_string(),
            ..ShutdownReport::default()
        };

        self.scheduler.suppress();
        self.scheduler.stop();

        let supervisor = self.scheduler.supervisor();
        let drained = supervisor.drain(self.grace).await;
        report.exited = drained.exited;
        report.killed = drained.killed;

        self.enter(ShutdownPhase::CleaningLocks);
        match supervisor.locks().remove_owned() {
            Ok(removed) => {
                debug!(removed, "Removed owned lock files");
                report.locks_removed = removed;
            }
            Err(e) => {
                warn!(error = %e, "Failed to clean up lock files");
                report.failures.push(format!("locks: {e}"));
            }
        }

        self.enter(ShutdownPhase::ClosingResources);
        for resource in &self.resources {
            let name = resource.name().to_string();
            match tokio::time::timeout(self.grace, resource.close()).await {
                Ok(Ok(())) => {
                    debug!(resource = %name, "Closed resource");
                    report.resources_closed.push(name);
                }
                Ok(Err(e)) => {
                    warn!(resource = %name, error = %e, "Failed to close resource");
                    report.failures.push(format!("{name}: {e}"));
                }
                Err(_) => {
                    warn!(resource = %name, "Timed out closing resource");
                    report.failures.push(format!("{name}: timed out"));
                }
            }
        }

        self.enter(ShutdownPhase::Exited);
        info!(
            exited = report.exited.len(),
            killed = report.killed.len(),
            locks_removed = report.locks_removed,
            failures = report.failures.len(),
            "Shutdown complete"
        );
        Some(report)
    }

    fn enter(&self, phase: ShutdownPhase) {
        debug!(%phase, "Shutdown phase");
        self.phase.send_replace(phase);
    }
}
