//! Owned periodic purge of expired store entries.
//!
//! Every store already rejects expired entries on read, so sweeping only bounds how much dead
//! state is kept around. A [`Sweeper`] is started explicitly, owns its task, and is stopped
//! explicitly; dropping it without calling [`Sweeper::stop`] cancels the task as well.

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::errors::StoreError;

/// Something holding entries that expire.
#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Physically remove entries that are already logically expired. Returns how many went.
    async fn sweep(&self) -> Result<u64, StoreError>;
}

pub struct Sweeper {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
    _drop_guard: DropGuard,
}

impl Sweeper {
    /// Sweep `target` every `interval`, starting one interval from now.
    pub fn start(target: Arc<dyn Sweep>, interval: Duration) -> Self {
        Self::start_with_shutdown(target, interval, CancellationToken::new())
    }

    /// Like [`Sweeper::start`], but also stopping when `shutdown` is cancelled.
    pub fn start_with_shutdown(target: Arc<dyn Sweep>, interval: Duration, shutdown: CancellationToken) -> Self {
        let name = target.name();
        let shutdown = shutdown.child_token();
        let handle = tokio::spawn(run(target, interval, shutdown.clone()));

        Self {
            name,
            handle,
            _drop_guard: shutdown.clone().drop_guard(),
            shutdown,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(sweeper = self.name, error = %e, "Sweeper task failed");
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run(target: Arc<dyn Sweep>, interval: Duration, shutdown: CancellationToken) {
    let name = target.name();
    tracing::info!(sweeper = name, interval = ?interval, "Starting expiry sweeper");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }

        // a sweep is a single atomic purge, so abandoning it mid-flight is safe
        tokio::select! {
            result = target.sweep() => match result {
                Ok(0) => {}
                Ok(removed) => {
                    counter!("gatehouse_swept_entries_total", "store" => name).increment(removed);
                    tracing::debug!(sweeper = name, removed, "Purged expired entries");
                }
                Err(e) => {
                    counter!("gatehouse_store_failures_total", "store" => name).increment(1);
                    tracing::warn!(sweeper = name, error = %e, "Sweep failed, will retry next interval");
                }
            },
            _ = shutdown.cancelled() => break,
        }
    }

    tracing::info!(sweeper = name, "Expiry sweeper shutting down");
}
