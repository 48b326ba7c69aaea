//! Shutdown triggers from the OS and from panics

use std::io;

use tokio::sync::mpsc;
use tracing::info;

/// Installed handlers for SIGINT and SIGTERM (Ctrl+C elsewhere)
#[derive(Debug)]
pub struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    /// Install the handlers
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be registered.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Install the handlers
    ///
    /// # Errors
    ///
    /// Never fails on this platform.
    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next signal and return its name
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        };
        info!(signal = name, "Shutdown signal received");
        name
    }

    /// Wait for the next signal and return its name
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        info!(signal = "CTRL_C", "Shutdown signal received");
        "CTRL_C"
    }
}

/// Forward every panic message to `tx`, after the previous hook has run
pub fn install_panic_hook(tx: mpsc::UnboundedSender<String>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        let _ = tx.send(info.to_string());
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_reaches_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        install_panic_hook(tx);

        let result = tokio::spawn(async { panic!("job monitor exploded") }).await;
        assert!(result.is_err());

        let message = rx.recv().await.unwrap();
        assert!(message.contains("job monitor exploded"), "{message}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_is_reported() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let mut signals = Signals::install().unwrap();
        kill(Pid::this(), Signal::SIGTERM).unwrap();
        assert_eq!(signals.recv().await, "SIGTERM");
    }
}
