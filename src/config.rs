//! Configuration management

use std::{collections::HashMap, collections::HashSet, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::scheduler::ScheduledTask;
use crate::{Error, Result};

/// Environment variable prefix, nested keys separated by `__`
pub const ENV_PREFIX: &str = "CRONWARDEN_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load after the configuration is extracted.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Scheduled tasks
    pub tasks: Vec<TaskConfig>,
    /// Default resilience policies for job code
    pub failsafe: FailsafeConfig,
    /// Status server configuration
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from defaults, an optional YAML file and the environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = expand_home(path_str);
            if path.exists() {
                match dotenvy::from_path(&path) {
                    Ok(()) => tracing::info!(path = %path.display(), "Loaded env file"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to load env file");
                    }
                }
            } else {
                tracing::debug!(path = %path.display(), "Env file not found (skipped)");
            }
        }
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            validate_job_name(&task.name)?;
            if !seen.insert(task.name.as_str()) {
                return Err(Error::Config(format!("Duplicate task name: {}", task.name)));
            }
            crate::scheduler::parse_schedule(&task.schedule)?;
        }

        if self.scheduler.command.trim().is_empty() {
            return Err(Error::Config("scheduler.command must not be empty".to_string()));
        }
        if self.failsafe.retry.max_attempts == 0 {
            return Err(Error::Config("failsafe.retry.max_attempts must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.failsafe.retry.jitter_factor) {
            return Err(Error::Config(
                "failsafe.retry.jitter_factor must be within 0.0..=1.0".to_string(),
            ));
        }
        let cb = &self.failsafe.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 || cb.half_open_max_calls == 0 {
            return Err(Error::Config(
                "failsafe.circuit_breaker thresholds must be >= 1".to_string(),
            ));
        }
        let rl = &self.failsafe.rate_limit;
        if rl.limit == 0 {
            return Err(Error::Config("failsafe.rate_limit.limit must be >= 1".to_string()));
        }
        if rl.window.is_zero() || rl.cleanup_interval.is_zero() {
            return Err(Error::Config(
                "failsafe.rate_limit window and cleanup_interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the registered task list, filling in the default timeout
    #[must_use]
    pub fn scheduled_tasks(&self) -> Vec<ScheduledTask> {
        self.tasks
            .iter()
            .map(|t| ScheduledTask {
                name: t.name.clone(),
                schedule: t.schedule.clone(),
                timeout: t.timeout.unwrap_or(self.scheduler.default_timeout),
            })
            .collect()
    }
}

/// Reject names that cannot safely become a lock file name
fn validate_job_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid task name '{name}': use letters, digits, '-', '_', '.', ':'"
        )))
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Register and fire tasks (the daemon still handles signals when off)
    pub enabled: bool,
    /// Directory holding one lock file per job name
    pub lock_dir: PathBuf,
    /// Timeout for tasks that do not set their own
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Age after which a lock held by a live process is taken over anyway
    #[serde(with = "humantime_serde")]
    pub stale_lock_after: Duration,
    /// How long shutdown waits for running jobs before killing them
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Job invocation template; `{job}` is replaced with the job name
    pub command: String,
    /// Working directory for job processes
    pub cwd: Option<PathBuf>,
    /// Extra environment for job processes
    pub env: HashMap<String, String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_dir: PathBuf::from(".locks"),
            default_timeout: Duration::from_secs(30 * 60),
            stale_lock_after: Duration::from_secs(60 * 60),
            shutdown_grace: Duration::from_secs(30),
            command: "npm run {job}".to_string(),
            cwd: None,
            env: HashMap::new(),
        }
    }
}

/// A single scheduled task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Job name (also the lock file name)
    pub name: String,
    /// Cron expression (5, 6 or 7 fields, or `@hourly` style aliases)
    pub schedule: String,
    /// Per-job timeout, defaults to `scheduler.default_timeout`
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

/// Failsafe configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FailsafeConfig {
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while closed before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Time since the last failure before a probe is admitted
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Concurrent probe calls allowed while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry, also the jitter floor
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap for the exponential delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.25,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per identifier per window
    pub limit: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How often expired entries are evicted
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve `/health` and `/status`
    pub enabled: bool,
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 9464,
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize a human-readable duration string (e.g., "30s", "5m", "100ms", "2h")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Secs(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse "100ms", "30s", "5m", "2h" or bare seconds
    ///
    /// # Errors
    ///
    /// Returns a message describing the malformed input.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };
        let scaled = |n: u64, unit: u64| {
            n.checked_mul(unit)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("invalid duration '{s}': too large"))
        };

        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse(mins).and_then(|m| scaled(m, 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            parse(hours).and_then(|h| scaled(h, 60 * 60))
        } else {
            parse(s).map(Duration::from_secs)
        }
    }

    fn format_duration(d: Duration) -> String {
        if d.subsec_millis() != 0 || d.as_secs() == 0 {
            format!("{}ms", d.as_millis())
        } else {
            format!("{}s", d.as_secs())
        }
    }

    /// Same format for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the value cannot be parsed.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] Duration);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.lock_dir, PathBuf::from(".locks"));
        assert_eq!(config.scheduler.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.failsafe.retry.max_attempts, 3);
        assert_eq!(config.failsafe.circuit_breaker.failure_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration_units() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        use humantime_serde::parse_duration;
        let err = parse_duration(&format!("{}h", u64::MAX)).unwrap_err();
        assert!(err.contains("too large"), "{err}");
        assert!(parse_duration(&format!("{}m", u64::MAX / 2)).is_err());
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_env_overrides_yaml_and_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cronwarden.yaml",
                r#"
scheduler:
  enabled: true
  lock_dir: /from/yaml
  shutdown_grace: 1m
  default_timeout: 10m
"#,
            )?;
            jail.set_env("CRONWARDEN_SCHEDULER__ENABLED", "false");
            jail.set_env("CRONWARDEN_SCHEDULER__SHUTDOWN_GRACE", "5s");
            jail.set_env("CRONWARDEN_SCHEDULER__LOCK_DIR", "/var/lock/cronwarden");

            let config = Config::load(Some(Path::new("cronwarden.yaml"))).map_err(|e| e.to_string())?;
            assert!(!config.scheduler.enabled);
            assert_eq!(config.scheduler.shutdown_grace, Duration::from_secs(5));
            assert_eq!(config.scheduler.lock_dir, PathBuf::from("/var/lock/cronwarden"));
            // Not overridden: YAML wins over the default
            assert_eq!(config.scheduler.default_timeout, Duration::from_secs(600));
            // Neither set: default
            assert_eq!(config.scheduler.stale_lock_after, Duration::from_secs(3600));

            let env_only = Config::load(None).map_err(|e| e.to_string())?;
            assert!(!env_only.scheduler.enabled);
            assert_eq!(env_only.scheduler.shutdown_grace, Duration::from_secs(5));
            assert_eq!(env_only.scheduler.default_timeout, Duration::from_secs(30 * 60));
            Ok(())
        });
    }

    #[test]
    fn test_tasks_deserialized_from_yaml() {
        let yaml = r#"
scheduler:
  lock_dir: /tmp/cronwarden-locks
  default_timeout: 10m
  command: "node scripts/{job}.js"
tasks:
  - name: ingest-products
    schedule: "0 */6 * * *"
    timeout: 1h
  - name: refresh-prices
    schedule: "@hourly"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].timeout, Some(Duration::from_secs(3600)));
        assert_eq!(config.tasks[1].timeout, None);

        let tasks = config.scheduled_tasks();
        assert_eq!(tasks[0].timeout, Duration::from_secs(3600));
        assert_eq!(tasks[1].timeout, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_names() {
        let mut config = Config::default();
        config.tasks = vec![
            TaskConfig {
                name: "sync".to_string(),
                schedule: "* * * * *".to_string(),
                timeout: None,
            },
            TaskConfig {
                name: "sync".to_string(),
                schedule: "* * * * *".to_string(),
                timeout: None,
            },
        ];
        assert!(matches!(config.validate(), Err(Error::Config(m)) if m.contains("Duplicate")));

        config.tasks.truncate(1);
        config.tasks[0].name = "../etc/passwd".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_schedule() {
        let mut config = Config::default();
        config.tasks = vec![TaskConfig {
            name: "sync".to_string(),
            schedule: "every tuesday".to_string(),
            timeout: None,
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronwarden.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "scheduler:\n  shutdown_grace: 5s\nserver:\n  port: 9999").unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.server.port, 9999);
        // Untouched sections keep their defaults
        assert_eq!(config.scheduler.default_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/cronwarden.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }
}
