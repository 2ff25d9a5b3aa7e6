//! Lease acquisition and heartbeating.
//!
//! A lease is the temporary exclusive claim a worker holds on a row:
//! `is_running = true` with a future `run_expires_at`. The manager wraps the
//! store's two atomic primitives, acquire-one and extend, and runs the
//! heartbeat loop that keeps a long attempt's lease fresh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::CommandRecord;
use crate::store::CommandStore;

/// Lease primitives bound to a store and a lease duration
/// (`lock_timeout_buffer`).
pub struct LeaseManager<S: CommandStore> {
    store: Arc<S>,
    lease_duration: Duration,
}

impl<S: CommandStore> Clone for LeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            lease_duration: self.lease_duration,
        }
    }
}

impl<S: CommandStore> LeaseManager<S> {
    /// Create a manager leasing for `lease_duration` per acquire/extend.
    pub fn new(store: Arc<S>, lease_duration: Duration) -> Self {
        Self {
            store,
            lease_duration,
        }
    }

    /// The configured lease duration.
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Atomically lease one eligible row for `target`. `None` means nothing
    /// eligible or a lost race; the poll loop simply tries again.
    pub async fn acquire(&self, target: &str) -> Result<Option<CommandRecord>> {
        self.store.acquire(target, self.lease_duration).await
    }

    /// Extend a held lease. `false` means the lease is already gone and the
    /// caller must stop heartbeating.
    pub async fn extend(&self, id: Uuid) -> Result<bool> {
        self.store.extend(id, self.lease_duration).await
    }

    /// Heartbeat loop for one attempt: extend every half lease until the
    /// lease is lost or `cancel` fires. Transient store errors are logged
    /// and retried on the next beat; the lease has slack for exactly that.
    pub async fn heartbeat(&self, id: Uuid, cancel: CancellationToken) {
        let period = self.lease_duration / 2;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }

            match self.extend(id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(command_id = %id, "lease no longer held, stopping heartbeat");
                    return;
                }
                Err(e) => {
                    warn!(command_id = %id, error = %e, "heartbeat extend failed");
                }
            }
        }
    }
}
