//! Cron-driven job scheduling
//!
//! The [`Scheduler`] owns one driver task per registered job. A driver sleeps
//! until the next fire time of its cron expression and hands the trigger to the
//! [`Supervisor`], which takes the job's lock and spawns the process. Missed or
//! skipped triggers are not replayed.

pub mod lock;
pub mod process;
pub mod shutdown;
pub mod signals;
pub mod supervisor;

pub use lock::{LockManager, LockRecord, OsProcessProbe, ProcessProbe};
pub use process::{CommandLauncher, JobExit, JobProcess, ProcessLauncher};
pub use shutdown::{ShutdownCoordinator, ShutdownPhase, ShutdownReport, ShutdownTrigger, SharedResource};
pub use supervisor::{DrainReport, JobCompletion, RunningJobInfo, SpawnOutcome, Supervisor};

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, elapsed_between};
use crate::{Error, Result};

/// A job registered with the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTask {
    /// Job name, also the lock file name
    pub name: String,
    /// Cron expression
    pub schedule: String,
    /// Per-run timeout
    #[serde(serialize_with = "crate::config::humantime_serde::serialize")]
    pub timeout: Duration,
}

/// Parse a cron expression.
///
/// Accepts standard 5-field expressions (minute resolution), 6- and 7-field
/// expressions with seconds and year, and the `@hourly`, `@daily`,
/// `@weekly`, `@monthly`, `@yearly` shorthands.
///
/// # Errors
///
/// Returns [`Error::Schedule`] for an expression that does not parse.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = match expr.to_ascii_lowercase().as_str() {
        "" => return Err(Error::Schedule("empty cron expression".to_string())),
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@weekly" => "0 0 0 * * Sun".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@hourly" => "0 0 * * * *".to_string(),
        _ if expr.split_whitespace().count() == 5 => format!("0 {expr}"),
        _ => expr.to_string(),
    };
    Schedule::from_str(&normalized).map_err(|e| Error::Schedule(format!("invalid cron expression '{expr}': {e}")))
}

struct Registered {
    task: ScheduledTask,
    schedule: Schedule,
}

/// Fires registered tasks on their cron schedules
pub struct Scheduler {
    supervisor: Arc<Supervisor>,
    clock: SharedClock,
    tasks: Mutex<Vec<Arc<Registered>>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    suppressed: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("suppressed", &self.is_suppressed())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler handing triggers to `supervisor`
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>, clock: SharedClock) -> Self {
        Self {
            supervisor,
            clock,
            tasks: Mutex::new(Vec::new()),
            drivers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            suppressed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Supervisor receiving triggers
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Register a task. Tasks registered after [`Scheduler::start`] begin
    /// firing immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schedule`] for a bad cron expression and
    /// [`Error::Config`] for a duplicate name.
    pub fn register_task(self: &Arc<Self>, task: ScheduledTask) -> Result<()> {
        let schedule = parse_schedule(&task.schedule)?;
        let registered = {
            let mut tasks = self.tasks.lock();
            if tasks.iter().any(|r| r.task.name == task.name) {
                return Err(Error::Config(format!("Task '{}' is already registered", task.name)));
            }
            let registered = Arc::new(Registered { task, schedule });
            tasks.push(Arc::clone(&registered));
            registered
        };
        info!(
            job = %registered.task.name,
            schedule = %registered.task.schedule,
            timeout_ms = registered.task.timeout.as_millis(),
            "Registered task"
        );

        if self.started.load(Ordering::SeqCst) {
            self.spawn_driver(registered);
        }
        Ok(())
    }

    /// Registered tasks, in registration order
    #[must_use]
    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().iter().map(|r| r.task.clone()).collect()
    }

    /// Next fire time of every task after the current time
    #[must_use]
    pub fn next_fire_times(&self) -> Vec<(ScheduledTask, Option<DateTime<Utc>>)> {
        let now = self.clock.now();
        self.tasks
            .lock()
            .iter()
            .map(|r| (r.task.clone(), r.schedule.after(&now).next()))
            .collect()
    }

    /// Start one driver per registered task. Calling again is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<_> = self.tasks.lock().clone();
        info!(tasks = tasks.len(), "Scheduler started");
        for registered in tasks {
            self.spawn_driver(registered);
        }
    }

    /// Stop handing triggers to the supervisor; drivers keep running
    pub fn suppress(&self) {
        if !self.suppressed.swap(true, Ordering::SeqCst) {
            info!("New triggers suppressed");
        }
    }

    /// Whether triggers are currently suppressed
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// Stop all drivers. Running jobs are not affected.
    pub fn stop(&self) {
        self.cancel.cancel();
        let drivers = std::mem::take(&mut *self.drivers.lock());
        for driver in &drivers {
            driver.abort();
        }
        debug!(drivers = drivers.len(), "Scheduler drivers stopped");
    }

    fn spawn_driver(self: &Arc<Self>, registered: Arc<Registered>) {
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.drive(&registered).await });
        self.drivers.lock().push(handle);
    }

    async fn drive(&self, registered: &Registered) {
        let task = &registered.task;
        let mut cursor = self.clock.now();

        loop {
            let Some(next) = registered.schedule.after(&cursor).next() else {
                info!(job = %task.name, "Schedule has no further fire times");
                return;
            };
            let wait = elapsed_between(self.clock.now(), next);
            debug!(job = %task.name, next = %next, wait_ms = wait.as_millis(), "Next trigger");

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = self.cancel.cancelled() => return,
            }

            // Skip any fire times that passed while we were asleep
            cursor = next.max(self.clock.now());

            if self.is_suppressed() {
                debug!(job = %task.name, "Trigger suppressed");
                continue;
            }

            match self.supervisor.spawn(&task.name, task.timeout) {
                SpawnOutcome::Started => {}
                SpawnOutcome::Failed => warn!(job = %task.name, "Trigger failed to start job"),
                outcome => debug!(job = %task.name, ?outcome, "Trigger skipped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::scheduler::supervisor::tests::{FakeLauncher, Script, lock_manager};
    use chrono::TimeZone;

    fn scheduler(scripts: &[(&str, Script)]) -> (tempfile::TempDir, Arc<Scheduler>, Arc<FakeLauncher>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = TokioClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let launcher = FakeLauncher::with(scripts);
        let supervisor = Arc::new(Supervisor::with_clock(
            lock_manager(dir.path()),
            launcher.clone(),
            clock.clone(),
        ));
        (dir, Arc::new(Scheduler::new(supervisor, clock)), launcher)
    }

    fn task(name: &str, schedule: &str, timeout: Duration) -> ScheduledTask {
        ScheduledTask {
            name: name.to_string(),
            schedule: schedule.to_string(),
            timeout,
        }
    }

    #[test]
    fn test_parse_schedule_forms() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("30 0 9 * * Mon-Fri").is_ok());
        assert!(parse_schedule("@hourly").is_ok());
        assert!(parse_schedule("@Daily").is_ok());
        assert!(matches!(parse_schedule(""), Err(Error::Schedule(_))));
        assert!(matches!(parse_schedule("every tuesday"), Err(Error::Schedule(_))));
        assert!(matches!(parse_schedule("61 * * * *"), Err(Error::Schedule(_))));
    }

    #[test]
    fn test_five_field_fires_on_the_minute() {
        let schedule = parse_schedule("*/15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 6, 1, 8, 7, 30).unwrap();
        let next: Vec<_> = schedule.after(&from).take(2).collect();
        assert_eq!(next[0], Utc.with_ymd_and_hms(2024, 6, 1, 8, 15, 0).unwrap());
        assert_eq!(next[1], Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_rejects_duplicates_and_bad_cron() {
        let (_dir, sched, _launcher) = scheduler(&[]);
        sched.register_task(task("a", "@hourly", Duration::from_secs(1))).unwrap();
        assert!(matches!(
            sched.register_task(task("a", "@daily", Duration::from_secs(1))),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            sched.register_task(task("b", "nonsense", Duration::from_secs(1))),
            Err(Error::Schedule(_))
        ));
        assert_eq!(sched.tasks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_on_schedule() {
        let (_dir, sched, launcher) = scheduler(&[("tick", Script::Exit(Duration::from_secs(1), 0))]);
        sched.register_task(task("tick", "* * * * *", Duration::from_secs(30))).unwrap();
        sched.start();

        // 08:00:00 start, fires at 08:01, 08:02, 08:03
        tokio::time::sleep(Duration::from_secs(3 * 60 + 30)).await;
        assert_eq!(launcher.launch_count("tick"), 3);
        sched.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_trigger_is_skipped() {
        let (_dir, sched, launcher) = scheduler(&[("long", Script::Exit(Duration::from_secs(150), 0))]);
        sched.register_task(task("long", "* * * * *", Duration::from_secs(600))).unwrap();
        sched.start();

        // Runs 08:01-08:03:30; the 08:02 and 08:03 triggers are skipped
        tokio::time::sleep(Duration::from_secs(3 * 60 + 45)).await;
        assert_eq!(launcher.launch_count("long"), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(launcher.launch_count("long"), 2);
        sched.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_jobs_run_concurrently() {
        let (_dir, sched, launcher) = scheduler(&[
            ("a", Script::Exit(Duration::from_secs(90), 0)),
            ("b", Script::Exit(Duration::from_secs(90), 0)),
        ]);
        sched.register_task(task("a", "* * * * *", Duration::from_secs(600))).unwrap();
        sched.register_task(task("b", "* * * * *", Duration::from_secs(600))).unwrap();
        sched.start();

        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(sched.supervisor().running_count(), 2);
        assert_eq!(launcher.launch_count("a"), 1);
        assert_eq!(launcher.launch_count("b"), 1);
        sched.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppress_and_stop() {
        let (_dir, sched, launcher) = scheduler(&[("tick", Script::Exit(Duration::from_secs(1), 0))]);
        sched.register_task(task("tick", "* * * * *", Duration::from_secs(30))).unwrap();
        sched.start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(launcher.launch_count("tick"), 1);

        sched.suppress();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(launcher.launch_count("tick"), 1);

        sched.stop();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(launcher.launch_count("tick"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_drivers() {
        let (_dir, sched, _launcher) = scheduler(&[]);
        sched.register_task(task("a", "@hourly", Duration::from_secs(1))).unwrap();
        sched.start();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let registered = Arc::clone(&sched.tasks.lock()[0]);
        // Held by the task list, the driver and this test
        assert_eq!(Arc::strong_count(&registered), 3);

        sched.stop();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(sched.drivers.lock().is_empty());
        assert_eq!(Arc::strong_count(&registered), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_fire_times() {
        let (_dir, sched, _launcher) = scheduler(&[]);
        sched.register_task(task("nightly", "0 2 * * *", Duration::from_secs(60))).unwrap();
        let next = sched.next_fire_times();
        assert_eq!(next[0].0.name, "nightly");
        assert_eq!(next[0].1, Some(Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap()));
    }
}
