//! Starting job processes
//!
//! The supervisor only sees [`ProcessLauncher`] and [`JobProcess`], so its
//! timeout and lock handling can be driven by fakes in tests.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::{Error, Result};

/// Placeholder replaced by the job name in the command template
pub const JOB_PLACEHOLDER: &str = "{job}";

/// How a job process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobExit {
    /// Exit code, absent when killed by a signal
    pub code: Option<i32>,
    /// Terminating signal number (unix only)
    pub signal: Option<i32>,
}

impl JobExit {
    /// Exited with status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for JobExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for JobExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A started job
#[async_trait]
pub trait JobProcess: Send {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit. Must be cancel safe.
    async fn wait(&mut self) -> io::Result<JobExit>;

    /// Ask the process to stop (SIGTERM on unix)
    fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process without waiting for it to cooperate
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts a named job
pub trait ProcessLauncher: Send + Sync + fmt::Debug {
    /// Launch `job` as an independent process
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] when the process cannot be started.
    fn launch(&self, job: &str) -> Result<Box<dyn JobProcess>>;
}

/// Launches jobs by running a command template
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl CommandLauncher {
    /// Parse a shell-style template such as `npm run {job}`.
    ///
    /// Without a `{job}` placeholder the job name is appended as the last
    /// argument.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty or unbalanced template.
    pub fn new(template: &str) -> Result<Self> {
        let mut parts = shlex::split(template)
            .ok_or_else(|| Error::Config(format!("Cannot parse command template '{template}'")))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("Command template is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            cwd: None,
            env: HashMap::new(),
        })
    }

    /// Build from the scheduler section of the config
    ///
    /// # Errors
    ///
    /// See [`CommandLauncher::new`].
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let mut launcher = Self::new(&config.command)?;
        launcher.cwd.clone_from(&config.cwd);
        launcher.env.clone_from(&config.env);
        Ok(launcher)
    }

    /// Program and arguments for `job`
    #[must_use]
    pub fn command_line(&self, job: &str) -> (String, Vec<String>) {
        let templated =
            self.program.contains(JOB_PLACEHOLDER) || self.args.iter().any(|a| a.contains(JOB_PLACEHOLDER));
        let program = self.program.replace(JOB_PLACEHOLDER, job);
        let mut args: Vec<String> = self.args.iter().map(|a| a.replace(JOB_PLACEHOLDER, job)).collect();
        if !templated {
            args.push(job.to_string());
        }
        (program, args)
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, job: &str) -> Result<Box<dyn JobProcess>> {
        let (program, args) = self.command_line(job);
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&self.env)
            .env("CRONWARDEN_JOB", job)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("Failed to start '{program}' for job '{job}': {e}")))?;
        debug!(job, program = %program, ?args, pid = child.id(), "Spawned job process");
        Ok(Box::new(ChildProcess { child }))
    }
}

/// A real OS child process
#[derive(Debug)]
struct ChildProcess {
    child: Child,
}

#[async_trait]
impl JobProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<JobExit> {
        self.child.wait().await.map(JobExit::from)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // Already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}
