//! Cronwarden - cron job scheduler daemon

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cronwarden::{
    cli::{Cli, Command},
    clock::{self, elapsed_between},
    config::Config,
    scheduler::{
        CommandLauncher, LockManager, OsProcessProbe, ProcessProbe, Scheduler, ShutdownCoordinator,
        ShutdownTrigger, Supervisor, parse_schedule,
        signals::{Signals, install_panic_hook},
    },
    server::{self, AppState},
    setup_tracing,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Trigger { job, timeout }) => run_trigger(&config, &job, timeout).await,
        Some(Command::Locks) => run_locks(&config),
        Some(Command::Validate) => run_validate(&config),
        Some(Command::Run) | None => run_daemon(config).await,
    }
}

fn build_supervisor(config: &Config) -> cronwarden::Result<Arc<Supervisor>> {
    let locks = Arc::new(LockManager::new(
        &config.scheduler.lock_dir,
        config.scheduler.stale_lock_after,
    ));
    let launcher = Arc::new(CommandLauncher::from_config(&config.scheduler)?);
    Ok(Arc::new(Supervisor::new(locks, launcher)))
}

/// Run the daemon until a signal or a panic
async fn run_daemon(config: Config) -> ExitCode {
    let supervisor = match build_supervisor(&config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "Failed to set up job launcher");
            return ExitCode::FAILURE;
        }
    };
    let scheduler = Arc::new(Scheduler::new(supervisor, clock::system()));

    if config.scheduler.enabled {
        for task in config.scheduled_tasks() {
            if let Err(e) = scheduler.register_task(task) {
                error!(error = %e, "Failed to register task");
                return ExitCode::FAILURE;
            }
        }
        scheduler.start();
    } else {
        info!("Scheduler disabled, waiting for shutdown signal");
    }

    let coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&scheduler),
        config.scheduler.shutdown_grace,
    ));

    let mut signals = match Signals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    install_panic_hook(fatal_tx);

    let server_cancel = CancellationToken::new();
    let server_task = config.server.enabled.then(|| {
        let state = Arc::new(AppState::new(
            Arc::clone(&scheduler),
            Arc::clone(&coordinator),
            &config.failsafe.rate_limit,
        ));
        let server_config = config.server.clone();
        let cancel = server_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(&server_config, state, cancel).await {
                error!(error = %e, "Status server failed");
            }
        })
    });

    info!(
        tasks = scheduler.tasks().len(),
        lock_dir = %config.scheduler.lock_dir.display(),
        "Cronwarden running"
    );

    let trigger = tokio::select! {
        name = signals.recv() => ShutdownTrigger::Signal(name),
        Some(reason) = fatal_rx.recv() => ShutdownTrigger::Fatal(reason),
    };

    // Repeat signals during shutdown are logged and ignored
    let repeat = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            loop {
                let name = signals.recv().await;
                coordinator.shutdown(ShutdownTrigger::Signal(name)).await;
            }
        })
    };

    server_cancel.cancel();
    coordinator.shutdown(trigger).await;
    repeat.abort();
    if let Some(task) = server_task {
        let _ = task.await;
    }

    ExitCode::SUCCESS
}

/// Run one job now
async fn run_trigger(config: &Config, job: &str, timeout: Option<std::time::Duration>) -> ExitCode {
    let timeout = timeout
        .or_else(|| config.tasks.iter().find(|t| t.name == job).and_then(|t| t.timeout))
        .unwrap_or(config.scheduler.default_timeout);

    let supervisor = match build_supervisor(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "Failed to set up job launcher");
            return ExitCode::FAILURE;
        }
    };

    match supervisor.run_now(job, timeout).await {
        Ok(completion) if completion.success() => {
            println!("✅ {job} completed in {:.1}s", completion.duration.as_secs_f64());
            ExitCode::SUCCESS
        }
        Ok(completion) => {
            let status = completion
                .exit
                .map_or_else(|| "unknown status".to_string(), |e| e.to_string());
            let suffix = if completion.timed_out { " after timeout" } else { "" };
            eprintln!("❌ {job} failed with {status}{suffix}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Print lock records
fn run_locks(config: &Config) -> ExitCode {
    let locks = LockManager::new(&config.scheduler.lock_dir, config.scheduler.stale_lock_after);
    let records = match locks.list() {
        Ok(records) => records,
        Err(e) => {
            eprintln!("❌ Cannot read {}: {e}", config.scheduler.lock_dir.display());
            return ExitCode::FAILURE;
        }
    };

    if records.is_empty() {
        println!("No locks held in {}", config.scheduler.lock_dir.display());
        return ExitCode::SUCCESS;
    }

    let now = Utc::now();
    println!("{:<32} {:>8} {:>10} {:<6} VERSION", "JOB", "PID", "AGE", "ALIVE");
    for record in records {
        let age = elapsed_between(record.start_time, now);
        let alive = OsProcessProbe.is_alive(record.owner_pid);
        let stale = alive && age > config.scheduler.stale_lock_after;
        println!(
            "{:<32} {:>8} {:>9}s {:<6} {}{}",
            record.job_name,
            record.owner_pid,
            age.as_secs(),
            if alive { "yes" } else { "no" },
            record.runtime_version,
            if stale { "  (stale)" } else { "" },
        );
    }
    ExitCode::SUCCESS
}

/// Print each task with its next run
fn run_validate(config: &Config) -> ExitCode {
    println!("✅ Configuration valid ({} task(s))", config.tasks.len());
    if !config.scheduler.enabled {
        warn!("scheduler.enabled is false; tasks will not fire");
    }

    let now = Utc::now();
    for task in config.scheduled_tasks() {
        let next = parse_schedule(&task.schedule)
            .ok()
            .and_then(|s| s.after(&now).next())
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
        println!(
            "   {:<32} {:<20} timeout {:>6}s  next {next}",
            task.name,
            task.schedule,
            task.timeout.as_secs()
        );
    }
    ExitCode::SUCCESS
}
