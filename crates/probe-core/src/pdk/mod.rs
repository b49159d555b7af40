//! Plumbing shared by the monitor modules: per-module configuration and the
//! shutdown signal every long running task listens to.

mod config;

pub use config::*;

use tokio::sync::watch;

/// Returned by a module task which stopped because it was asked to.
#[derive(Debug)]
pub struct CleanExit(());

pub type ModuleError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Receiving half of the shutdown notification. Every clone is notified.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownSender(tx), ShutdownSignal { rx })
    }

    /// Completes once shutdown is requested, or once the sender is gone.
    pub async fn recv(&mut self) -> Result<CleanExit, ModuleError> {
        let _ = self.rx.wait_for(|stop| *stop).await;
        Ok(CleanExit(()))
    }
}

pub struct ShutdownSender(watch::Sender<bool>);

impl ShutdownSender {
    pub fn send_signal(self) {
        self.0.send_replace(true);
    }
}
