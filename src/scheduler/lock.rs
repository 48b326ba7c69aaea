//! Advisory per-job lock files
//!
//! One JSON file per job under the lock directory records which process is
//! running it. Acquisition is best effort: there is no OS-level locking, and
//! a lock whose owner is dead can always be reclaimed.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::{self, SharedClock, elapsed_between};
use crate::{Error, Result};

/// File extension of lock files
pub const LOCK_EXTENSION: &str = "lock";

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// PID of the owning scheduler process
    pub owner_pid: u32,
    /// When the lock was taken
    pub start_time: DateTime<Utc>,
    /// Job the lock guards
    pub job_name: String,
    /// Name and version of the program that wrote it
    pub runtime_version: String,
}

/// Answers whether a PID belongs to a live process
pub trait ProcessProbe: Send + Sync + fmt::Debug {
    /// Whether `pid` is alive
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by a signal-0 `kill`
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessProbe;

impl ProcessProbe for OsProcessProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            // EPERM: exists, owned by someone else
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        // No cheap liveness check; staleness still applies
        true
    }
}

/// Reads and writes lock files in one directory
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    stale_after: Duration,
    pid: u32,
    clock: SharedClock,
    probe: Arc<dyn ProcessProbe>,
}

impl LockManager {
    /// Create a manager for `dir`, owned by the current process
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
            pid: std::process::id(),
            clock: clock::system(),
            probe: Arc::new(OsProcessProbe),
        }
    }

    /// Act as if running under `pid`
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Read time from `clock`
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use `probe` for owner liveness checks
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// PID written into acquired locks
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Lock directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file for `job`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] when the name would escape the lock directory.
    pub fn lock_path(&self, job: &str) -> Result<PathBuf> {
        if job.is_empty() || job.starts_with('.') || job.contains(['/', '\\']) {
            return Err(Error::Lock(format!("invalid job name '{job}'")));
        }
        Ok(self.dir.join(format!("{job}.{LOCK_EXTENSION}")))
    }

    /// Try to take the lock for `job`.
    ///
    /// Denied when a live owner holds a lock younger than the staleness
    /// timeout, or when the lock file cannot be read or written. A live owner
    /// past the timeout is logged and overridden.
    pub fn acquire(&self, job: &str) -> bool {
        match self.read(job) {
            Ok(None) => {}
            Ok(Some(existing)) => {
                let age = elapsed_between(existing.start_time, self.clock.now());
                if self.probe.is_alive(existing.owner_pid) {
                    if age <= self.stale_after {
                        debug!(
                            job,
                            owner_pid = existing.owner_pid,
                            age_ms = age.as_millis(),
                            "Lock held by a running process"
                        );
                        return false;
                    }
                    warn!(
                        job,
                        owner_pid = existing.owner_pid,
                        age_ms = age.as_millis(),
                        stale_after_ms = self.stale_after.as_millis(),
                        "Lock owner still alive past staleness timeout, taking over"
                    );
                } else {
                    info!(job, owner_pid = existing.owner_pid, "Reclaiming lock from dead process");
                }
            }
            Err(e) => {
                error!(job, error = %e, "Cannot read lock file, not acquiring");
                return false;
            }
        }

        let record = LockRecord {
            owner_pid: self.pid,
            start_time: self.clock.now(),
            job_name: job.to_string(),
            runtime_version: runtime_version(),
        };
        let written = serde_json::to_vec_pretty(&record)
            .map_err(Error::from)
            .and_then(|bytes| self.write_atomic(job, &bytes));
        match written {
            Ok(()) => {
                debug!(job, pid = self.pid, "Lock acquired");
                true
            }
            Err(e) => {
                error!(job, error = %e, "Failed to write lock file");
                false
            }
        }
    }

    /// Clear the lock for `job` if this process owns it.
    ///
    /// The file is emptied rather than removed. Failures are logged.
    pub fn release(&self, job: &str) {
        match self.read(job) {
            Ok(Some(record)) if record.owner_pid == self.pid => match self.write_atomic(job, &[]) {
                Ok(()) => debug!(job, "Lock released"),
                Err(e) => error!(job, error = %e, "Failed to clear lock file"),
            },
            Ok(Some(record)) => {
                warn!(job, owner_pid = record.owner_pid, "Not releasing lock owned by another process");
            }
            Ok(None) => debug!(job, "No lock to release"),
            Err(e) => error!(job, error = %e, "Cannot read lock file for release"),
        }
    }

    /// Current holder of the lock for `job`; an empty or missing file means none
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn read(&self, job: &str) -> Result<Option<LockRecord>> {
        read_record(&self.lock_path(job)?)
    }

    /// Every held lock in the directory, sorted by job name.
    ///
    /// Unreadable files are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory exists but cannot be listed.
    pub fn list(&self) -> Result<Vec<LockRecord>> {
        let mut records: Vec<LockRecord> = self
            .lock_files()?
            .into_iter()
            .filter_map(|path| match read_record(&path) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable lock file");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(records)
    }

    /// Delete every lock file owned by this process, returning the count
    ///
    /// # Errors
    ///
    /// Returns an error when the directory exists but cannot be listed.
    /// Individual files that fail are logged and skipped.
    pub fn remove_owned(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.lock_files()? {
            match read_record(&path) {
                Ok(Some(record)) if record.owner_pid == self.pid => match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(job = %record.job_name, "Removed lock file");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove lock file"),
                },
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable lock file"),
            }
        }
        Ok(removed)
    }

    fn lock_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == LOCK_EXTENSION))
            .collect())
    }

    /// Write through a temp file in the same directory, then rename over
    fn write_atomic(&self, job: &str, contents: &[u8]) -> Result<()> {
        let path = self.lock_path(job)?;
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(".{job}.{}.tmp", self.pid));
        if let Err(e) = fs::write(&tmp, contents).and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&contents)?))
}

fn runtime_version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
