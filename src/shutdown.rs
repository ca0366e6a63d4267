//! Graceful shutdown (SPEC_FULL.md §2), ported from the teacher's
//! `sig_down.rs`: listens for SIGTERM/SIGINT and fans out a
//! [`CancellationToken`] that every worker and background task observes at
//! its suspension points (spec §5 "cancellation and timeouts").

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Owns the OS signal listeners and the cancellation token derived from
/// them, plus a [`TaskTracker`] the caller registers background tasks with
/// so shutdown can wait for them to finish.
pub struct SigDown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl SigDown {
    pub fn try_new() -> std::io::Result<Self> {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let signal_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = terminate.recv() => info!("received SIGTERM"),
                _ = interrupt.recv() => info!("received SIGINT"),
            }
            signal_token.cancel();
        });
        Ok(Self { token, tracker })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Waits for the shutdown signal, then for every tracked task to finish
    /// — the process does not exit until the wallet pool reports every
    /// lease released or a hard deadline elapses (spec §5).
    pub async fn recv(&self) {
        self.token.cancelled().await;
        self.tracker.close();
        self.tracker.wait().await;
    }
}
