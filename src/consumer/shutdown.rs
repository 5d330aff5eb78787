//! Graceful shutdown management for a binding

use crate::consumer::record::Partition;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the binding is stopping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Requested by the embedding application (signal, `shutdown()`)
    Requested,
    /// A fatal record with `onFatal: stop`
    FatalRecord { partition: Partition, offset: i64 },
    /// The broker stream ended or failed
    StreamClosed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Requested => write!(f, "shutdown requested"),
            ShutdownReason::FatalRecord { partition, offset } => {
                write!(f, "fatal record at {}@{}", partition, offset)
            }
            ShutdownReason::StreamClosed => write!(f, "consumer stream closed"),
        }
    }
}

/// Shutdown state shared by the dispatch loop and every partition worker
#[derive(Debug, Default)]
pub struct ShutdownState {
    token: CancellationToken,
    shutdown_complete: AtomicBool,
    shutdown_start: Mutex<Option<Instant>>,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin the shutdown process; the first reason wins
    pub fn begin_shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.reason.lock();
            if current.is_some() {
                return;
            }
            info!(reason = %reason, "Shutdown initiated");
            *current = Some(reason);
        }
        *self.shutdown_start.lock() = Some(Instant::now());
        self.token.cancel();
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled when shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Why shutdown began, if it did
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    /// Complete the shutdown process
    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Release);
        if let Some(duration) = self.shutdown_duration() {
            info!("Shutdown completed in {:?}", duration);
        }
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    /// Get the duration since shutdown started
    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.lock().map(|start| start.elapsed())
    }
}

/// Waits for worker tasks within a grace period, aborting stragglers
#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Join every handle; returns how many had to be aborted
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>) -> usize {
        let deadline = Instant::now() + self.grace_period;
        let mut aborted = 0;

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Worker task ended abnormally"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            warn!(
                aborted,
                "Grace period of {:?} elapsed; in-flight work abandoned without commit",
                self.grace_period
            );
        }
        aborted
    }
}
