//! Cross-context control flags between the bus callbacks and the lifecycle loop.
//!
//! Each flag is a single slot: any number of requests before the loop looks at
//! it collapse into one.

use conduit_core::TransportParams;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct ControlSignals {
    reconfigure: AtomicBool,
    restart: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
    baseline: OnceLock<TransportParams>,
}

impl ControlSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block-only change: reload configuration at the next cycle boundary
    pub fn request_reconfigure(&self) {
        self.reconfigure.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Reads and clears the pending-reconfigure flag
    pub fn take_reconfigure(&self) -> bool {
        self.reconfigure.swap(false, Ordering::SeqCst)
    }

    pub fn reconfigure_pending(&self) -> bool {
        self.reconfigure.load(Ordering::SeqCst)
    }

    /// Connection-info change: release the transport and exit with success
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Shutdown or restart, either one ends the process
    pub fn stop_requested(&self) -> bool {
        self.shutdown_requested() || self.restart_requested()
    }

    /// Records the transport parameters the process was started with.
    /// Only the first call wins.
    pub fn pin_baseline(&self, params: TransportParams) -> bool {
        self.baseline.set(params).is_ok()
    }

    pub fn baseline(&self) -> Option<&TransportParams> {
        self.baseline.get()
    }

    /// Sleeps for `duration`, returning early once a reconfigure or stop is pending
    pub async fn wait(&self, duration: Duration) {
        self.sleep_unless(duration, || self.reconfigure_pending() || self.stop_requested())
            .await
    }

    /// Sleeps the full `duration`; only a stop request cuts it short
    pub async fn backoff(&self, duration: Duration) {
        self.sleep_unless(duration, || self.stop_requested()).await
    }

    // A wake-up is only a hint: `notify_one` keeps a permit when nobody waits,
    // so the condition is re-checked before leaving early.
    async fn sleep_unless<F>(&self, duration: Duration, done: F)
    where
        F: Fn() -> bool,
    {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            if done() {
                return;
            }
            tokio::select! {
                _ = &mut sleep => return,
                _ = self.wake.notified() => {}
            }
        }
    }
}

/// Turns SIGTERM / Ctrl-C into an orderly shutdown request
pub fn spawn_signal_listener(signals: Arc<ControlSignals>) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Termination signal received, shutting down");
        signals.request_shutdown();
    })
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
