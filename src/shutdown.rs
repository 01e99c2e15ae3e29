//! Run-wide stop coordination
//!
//! A [`StopHandle`] owns the root cancellation token for a run. Stopping
//! requires a reason so an abort can always be traced back; the first reason
//! wins and later calls are no-ops.

use crate::error::{Result, RetraceError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reason-bearing, idempotent stop trigger
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

struct StopState {
    token: CancellationToken,
    stopped: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopState {
                token: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Root token; child scopes hang off this via [`CancellationToken::child_token`]
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Cancel the root exactly once, recording the reason.
    ///
    /// An empty reason is rejected: an untraceable stop is a bug in the
    /// caller. A second call with any reason is a no-op.
    pub fn stop(&self, reason: &str) -> Result<()> {
        if reason.is_empty() {
            return Err(RetraceError::Shutdown(
                "cannot stop without a reason".to_string(),
            ));
        }
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.inner.reason.lock() = Some(reason.to_string());
        info!(reason, "stopping retrace");
        self.inner.token.cancel();
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// First recorded stop reason, if any
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Resolves when the root has been cancelled
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Spawn the interrupt/terminate listener. The signal cancels the root
    /// exactly once; repeated signals are absorbed by the stop guard.
    pub fn spawn_signal_listener(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut interrupt =
                    signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
                let mut terminate =
                    signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            if let Err(e) = handle.stop("signal received") {
                warn!("failed to stop on signal: {}", e);
            }
        });
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}
