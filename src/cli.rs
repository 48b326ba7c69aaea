//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde::parse_duration;

/// Cron job scheduler with lock files, timeouts and graceful shutdown
#[derive(Parser, Debug)]
#[command(name = "cronwarden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CRONWARDEN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CRONWARDEN_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CRONWARDEN_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to running the daemon)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler until SIGINT/SIGTERM (default)
    Run,

    /// Run one job now and wait for it to exit
    Trigger {
        /// Job name
        #[arg(required = true)]
        job: String,

        /// Timeout, e.g. `90s` or `15m` (defaults to the task's or the global timeout)
        #[arg(short, long, value_parser = parse_duration)]
        timeout: Option<Duration>,
    },

    /// List lock files and their owners
    Locks,

    /// Check the configuration and print each task's next run
    Validate,
}
