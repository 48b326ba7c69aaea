//! Job process supervision
//!
//! Spawns one process per trigger behind the job's lock, enforces the
//! per-job timeout and releases the lock when the process exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lock::LockManager;
use super::process::{JobExit, JobProcess, ProcessLauncher};
use crate::clock::{self, SharedClock};
use crate::{Error, Result};

const COMPLETION_CHANNEL_CAPACITY: usize = 64;

/// Result of asking the supervisor to start a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Process started
    Started,
    /// This supervisor is already running the job
    AlreadyRunning,
    /// Another process holds the job's lock
    LockContention,
    /// The process could not be launched
    Failed,
}

/// A job currently running, as reported by [`Supervisor::running_jobs`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningJobInfo {
    /// Job name
    pub job: String,
    /// OS process id
    pub pid: Option<u32>,
    /// When the process was spawned
    pub started_at: DateTime<Utc>,
    /// Timeout in milliseconds
    pub timeout_ms: u128,
}

/// Published when a job process exits
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletion {
    /// Job name
    pub job: String,
    /// Exit status, absent when waiting on the process failed
    pub exit: Option<JobExit>,
    /// When the process was spawned
    pub started_at: DateTime<Utc>,
    /// Time from spawn to exit
    #[serde(with = "crate::config::humantime_serde")]
    pub duration: Duration,
    /// Whether the timeout fired before exit
    pub timed_out: bool,
    /// Whether the process was force-killed during shutdown
    pub killed: bool,
    /// Error from waiting on the process
    pub error: Option<String>,
}

impl JobCompletion {
    /// Exited with status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit.is_some_and(|e| e.success())
    }
}

/// Names of drained jobs, split by how they ended
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Exited on their own within the grace period
    pub exited: Vec<String>,
    /// Force-killed at the deadline
    pub killed: Vec<String>,
}

struct RunningJob {
    run_id: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    timeout: Duration,
    force_kill: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Tracks running job processes
pub struct Supervisor {
    locks: Arc<LockManager>,
    launcher: Arc<dyn ProcessLauncher>,
    running: Mutex<HashMap<String, RunningJob>>,
    completions: broadcast::Sender<JobCompletion>,
    clock: SharedClock,
    next_run_id: AtomicU64,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("lock_dir", &self.locks.dir())
            .field("launcher", &self.launcher)
            .field("running", &self.running.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor
    #[must_use]
    pub fn new(locks: Arc<LockManager>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self::with_clock(locks, launcher, clock::system())
    }

    /// Create a supervisor stamping start times from `clock`
    #[must_use]
    pub fn with_clock(locks: Arc<LockManager>, launcher: Arc<dyn ProcessLauncher>, clock: SharedClock) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Self {
            locks,
            launcher,
            running: Mutex::new(HashMap::new()),
            completions,
            clock,
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Lock manager guarding spawns
    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Start `job` unless its lock is held, killing it with SIGTERM after `timeout`.
    ///
    /// Returns once the process is launched; exit is observed in the background.
    /// Must be called from within a tokio runtime.
    pub fn spawn(self: &Arc<Self>, job: &str, timeout: Duration) -> SpawnOutcome {
        if self.running.lock().contains_key(job) {
            warn!(job, "Job still running from a previous trigger, skipping");
            return SpawnOutcome::AlreadyRunning;
        }

        if !self.locks.acquire(job) {
            warn!(job, "Job locked by another process, skipping");
            return SpawnOutcome::LockContention;
        }

        let process = match self.launcher.launch(job) {
            Ok(process) => process,
            Err(e) => {
                error!(job, error = %e, "Failed to start job");
                self.locks.release(job);
                return SpawnOutcome::Failed;
            }
        };

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let pid = process.id();
        let started_at = self.clock.now();
        let force_kill = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        self.running.lock().insert(
            job.to_string(),
            RunningJob {
                run_id,
                pid,
                started_at,
                timeout,
                force_kill: force_kill.clone(),
                done: done_rx,
            },
        );
        info!(job, pid, timeout_ms = timeout.as_millis(), "Job started");

        let supervisor = Arc::clone(self);
        let job = job.to_string();
        tokio::spawn(async move {
            supervisor
                .monitor(job, run_id, started_at, process, timeout, force_kill)
                .await;
            let _ = done_tx.send(true);
        });

        SpawnOutcome::Started
    }

    async fn monitor(
        &self,
        job: String,
        run_id: u64,
        started_at: DateTime<Utc>,
        mut process: Box<dyn JobProcess>,
        timeout: Duration,
        force_kill: CancellationToken,
    ) {
        let started = Instant::now();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        let mut killed = false;

        let result = loop {
            tokio::select! {
                result = process.wait() => break result,
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(job = %job, timeout_ms = timeout.as_millis(), "Job exceeded timeout, terminating");
                    if let Err(e) = process.terminate() {
                        error!(job = %job, error = %e, "Failed to signal job");
                    }
                }
                () = force_kill.cancelled(), if !killed => {
                    killed = true;
                    warn!(job = %job, "Killing job");
                    if let Err(e) = process.kill() {
                        error!(job = %job, error = %e, "Failed to kill job");
                    }
                }
            }
        };
        let duration = started.elapsed();

        self.remove_running(&job, run_id);
        self.locks.release(&job);

        let elapsed_ms = duration.as_millis();
        let (exit, error) = match result {
            Ok(exit) if exit.success() => {
                info!(job = %job, elapsed_ms, "Job completed");
                (Some(exit), None)
            }
            Ok(exit) => {
                error!(job = %job, %exit, elapsed_ms, timed_out, "Job failed");
                (Some(exit), None)
            }
            Err(e) => {
                error!(job = %job, error = %e, elapsed_ms, "Lost track of job process");
                (None, Some(e.to_string()))
            }
        };

        let _ = self.completions.send(JobCompletion {
            job,
            exit,
            started_at,
            duration,
            timed_out,
            killed,
            error,
        });
    }

    fn remove_running(&self, job: &str, run_id: u64) {
        let mut running = self.running.lock();
        if running.get(job).is_some_and(|r| r.run_id == run_id) {
            running.remove(job);
        }
    }

    /// Whether `job` is running under this supervisor
    #[must_use]
    pub fn is_running(&self, job: &str) -> bool {
        self.running.lock().contains_key(job)
    }

    /// Number of running jobs
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Snapshot of running jobs, sorted by name
    #[must_use]
    pub fn running_jobs(&self) -> Vec<RunningJobInfo> {
        let mut jobs: Vec<_> = self
            .running
            .lock()
            .iter()
            .map(|(job, r)| RunningJobInfo {
                job: job.clone(),
                pid: r.pid,
                started_at: r.started_at,
                timeout_ms: r.timeout.as_millis(),
            })
            .collect();
        jobs.sort_by(|a, b| a.job.cmp(&b.job));
        jobs
    }

    /// Receive a [`JobCompletion`] for every job that exits from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobCompletion> {
        self.completions.subscribe()
    }

    /// Start `job` and wait for it to exit
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] when the job is already running or locked,
    /// [`Error::Spawn`] when it cannot be started.
    pub async fn run_now(self: &Arc<Self>, job: &str, timeout: Duration) -> Result<JobCompletion> {
        let mut completions = self.subscribe();
        match self.spawn(job, timeout) {
            SpawnOutcome::Started => {}
            SpawnOutcome::AlreadyRunning => {
                return Err(Error::Lock(format!("job '{job}' is already running")));
            }
            SpawnOutcome::LockContention => {
                return Err(Error::Lock(format!("job '{job}' is locked by another process")));
            }
            SpawnOutcome::Failed => return Err(Error::Spawn(format!("job '{job}' failed to start"))),
        }

        loop {
            match completions.recv().await {
                Ok(completion) if completion.job == job => return Ok(completion),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Completion receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Internal("completion channel closed".to_string()));
                }
            }
        }
    }

    /// Wait up to `grace` for running jobs to exit, killing the rest.
    ///
    /// Killed jobs are dropped from the running set at the deadline whether or
    /// not the kill took effect.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let snapshot: Vec<_> = self
            .running
            .lock()
            .iter()
            .map(|(job, r)| (job.clone(), r.run_id, r.force_kill.clone(), r.done.clone()))
            .collect();

        if snapshot.is_empty() {
            return DrainReport::default();
        }
        info!(jobs = snapshot.len(), grace_ms = grace.as_millis(), "Waiting for running jobs");

        let deadline = Instant::now() + grace;
        let waits = snapshot.into_iter().map(|(job, run_id, force_kill, mut done)| async move {
            let exited = tokio::time::timeout_at(deadline, done.wait_for(|d| *d)).await.is_ok();
            if !exited {
                warn!(job = %job, "Grace period elapsed, killing job");
                force_kill.cancel();
                self.remove_running(&job, run_id);
            }
            (job, exited)
        });

        let mut report = DrainReport::default();
        for (job, exited) in join_all(waits).await {
            if exited {
                report.exited.push(job);
            } else {
                report.killed.push(job);
            }
        }
        report.exited.sort();
        report.killed.sort();
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scheduler::lock::ProcessProbe;
    use async_trait::async_trait;
    use std::io;
    use tokio::sync::oneshot;

    /// How a fake process behaves
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Script {
        /// Exit with this code after the delay
        Exit(Duration, i32),
        /// Run until signalled; exit on SIGTERM when true
        Hang { honours_term: bool },
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeLauncher {
        scripts: Mutex<HashMap<String, Script>>,
        pub(crate) launched: Mutex<Vec<String>>,
        pub(crate) terminated: Arc<Mutex<Vec<String>>>,
        pub(crate) killed: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLauncher {
        pub(crate) fn with(scripts: &[(&str, Script)]) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.iter().map(|(n, s)| ((*n).to_string(), *s)).collect()),
                ..Self::default()
            })
        }

        pub(crate) fn launch_count(&self, job: &str) -> usize {
            self.launched.lock().iter().filter(|j| *j == job).count()
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, job: &str) -> Result<Box<dyn JobProcess>> {
            let script = *self
                .scripts
                .lock()
                .get(job)
                .ok_or_else(|| Error::Spawn(format!("no such job '{job}'")))?;
            self.launched.lock().push(job.to_string());
            let (signal_tx, signal_rx) = oneshot::channel();
            let pid = 40_000 + u32::try_from(self.launched.lock().len()).unwrap();
            Ok(Box::new(FakeProcess {
                job: job.to_string(),
                pid,
                script,
                signal_tx: Some(signal_tx),
                signal_rx,
                terminated: Arc::clone(&self.terminated),
                killed: Arc::clone(&self.killed),
            }))
        }
    }

    struct FakeProcess {
        job: String,
        pid: u32,
        script: Script,
        signal_tx: Option<oneshot::Sender<JobExit>>,
        signal_rx: oneshot::Receiver<JobExit>,
        terminated: Arc<Mutex<Vec<String>>>,
        killed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JobProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        async fn wait(&mut self) -> io::Result<JobExit> {
            match self.script {
                Script::Exit(after, code) => {
                    tokio::select! {
                        () = tokio::time::sleep(after) => Ok(JobExit { code: Some(code), signal: None }),
                        exit = &mut self.signal_rx => exit.map_err(io::Error::other),
                    }
                }
                Script::Hang { .. } => (&mut self.signal_rx).await.map_err(io::Error::other),
            }
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.terminated.lock().push(self.job.clone());
            if matches!(self.script, Script::Hang { honours_term: false }) {
                return Ok(());
            }
            if let Some(tx) = self.signal_tx.take() {
                let _ = tx.send(JobExit { code: None, signal: Some(15) });
            }
            Ok(())
        }

        fn kill(&mut self) -> io::Result<()> {
            self.killed.lock().push(self.job.clone());
            if let Some(tx) = self.signal_tx.take() {
                let _ = tx.send(JobExit { code: None, signal: Some(9) });
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct AlwaysAlive;

    impl ProcessProbe for AlwaysAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
    }

    pub(crate) fn lock_manager(dir: &std::path::Path) -> Arc<LockManager> {
        Arc::new(LockManager::new(dir, Duration::from_secs(3600)).with_probe(Arc::new(AlwaysAlive)))
    }

    fn setup(scripts: &[(&str, Script)]) -> (tempfile::TempDir, Arc<Supervisor>, Arc<FakeLauncher>) {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::with(scripts);
        let supervisor = Arc::new(Supervisor::new(lock_manager(dir.path()), launcher.clone()));
        (dir, supervisor, launcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run_releases_lock() {
        let (_dir, sup, _launcher) = setup(&[("ok", Script::Exit(Duration::from_secs(5), 0))]);
        let completion = sup.run_now("ok", Duration::from_secs(60)).await.unwrap();

        assert!(completion.success());
        assert!(!completion.timed_out);
        assert!(completion.duration >= Duration::from_secs(5) && completion.duration < Duration::from_secs(6));
        assert!(!sup.is_running("ok"));
        assert!(sup.locks().read("ok").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_retried() {
        let (_dir, sup, launcher) = setup(&[("bad", Script::Exit(Duration::from_millis(10), 2))]);
        let completion = sup.run_now("bad", Duration::from_secs(60)).await.unwrap();
        assert!(!completion.success());
        assert_eq!(completion.exit.unwrap().code, Some(2));
        assert_eq!(launcher.launch_count("bad"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_spawn_skipped_while_running() {
        let (_dir, sup, launcher) = setup(&[("slow", Script::Exit(Duration::from_secs(30), 0))]);
        assert_eq!(sup.spawn("slow", Duration::from_secs(60)), SpawnOutcome::Started);
        assert_eq!(sup.spawn("slow", Duration::from_secs(60)), SpawnOutcome::AlreadyRunning);
        assert_eq!(launcher.launch_count("slow"), 1);
        assert_eq!(sup.running_jobs()[0].job, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_lock_blocks_spawn() {
        let (dir, sup, launcher) = setup(&[("report", Script::Exit(Duration::from_secs(1), 0))]);
        let other = LockManager::new(dir.path(), Duration::from_secs(3600)).with_pid(std::process::id() + 1);
        assert!(other.acquire("report"));

        assert_eq!(sup.spawn("report", Duration::from_secs(60)), SpawnOutcome::LockContention);
        assert_eq!(launcher.launch_count("report"), 0);
        assert!(matches!(sup.run_now("report", Duration::from_secs(60)).await, Err(Error::Lock(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_releases_lock() {
        let (_dir, sup, _launcher) = setup(&[]);
        assert_eq!(sup.spawn("missing", Duration::from_secs(1)), SpawnOutcome::Failed);
        assert!(sup.locks().read("missing").unwrap().is_none());
        assert!(!sup.is_running("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_terminates_and_releases_on_exit() {
        let (_dir, sup, launcher) = setup(&[("stuck", Script::Hang { honours_term: true })]);
        let completion = sup.run_now("stuck", Duration::from_secs(10)).await.unwrap();

        assert!(completion.timed_out);
        assert_eq!(completion.exit.unwrap().signal, Some(15));
        assert!(completion.duration >= Duration::from_secs(10) && completion.duration < Duration::from_secs(11));
        assert_eq!(*launcher.terminated.lock(), vec!["stuck".to_string()]);
        assert!(sup.locks().read("stuck").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_job_until_exit() {
        let (_dir, sup, launcher) = setup(&[("stubborn", Script::Hang { honours_term: false })]);
        assert_eq!(sup.spawn("stubborn", Duration::from_secs(1)), SpawnOutcome::Started);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(launcher.terminated.lock().len(), 1);
        // Still tracked and still locked after SIGTERM was ignored
        assert!(sup.is_running("stubborn"));
        assert!(sup.locks().read("stubborn").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_then_kills() {
        let (_dir, sup, launcher) = setup(&[
            ("quick", Script::Exit(Duration::from_secs(2), 0)),
            ("stubborn", Script::Hang { honours_term: false }),
        ]);
        let mut completions = sup.subscribe();
        sup.spawn("quick", Duration::from_secs(600));
        sup.spawn("stubborn", Duration::from_secs(600));

        let report = sup.drain(Duration::from_secs(30)).await;
        assert_eq!(report.exited, vec!["quick".to_string()]);
        assert_eq!(report.killed, vec!["stubborn".to_string()]);
        assert_eq!(sup.running_count(), 0);

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(completions.recv().await.unwrap());
        }
        let stubborn = seen.iter().find(|c| c.job == "stubborn").unwrap();
        assert!(stubborn.killed);
        assert_eq!(*launcher.killed.lock(), vec!["stubborn".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_with_nothing_running() {
        let (_dir, sup, _launcher) = setup(&[]);
        assert_eq!(sup.drain(Duration::from_secs(30)).await, DrainReport::default());
    }
}
