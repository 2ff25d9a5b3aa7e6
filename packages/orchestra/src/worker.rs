//! The per-process worker loop.
//!
//! One worker drives one `instance_key`: it leases eligible rows from the
//! store, spawns an [`Executor`] per row up to `max_in_flight`, reaps
//! finished ones, and idles on a cancellable sleep that the enqueue path can
//! interrupt through the [`WorkSignal`].
//!
//! ```text
//! Idle ──wake/interval──► Polling ──row──► Dispatching (spawn Executor)
//!  ▲                         │ none                │
//!  └────────── Reaping ◄─────┴──────────────────────┘
//! ```
//!
//! Concurrency is bounded twice: `max_in_flight` caps executors inside this
//! worker, and the store's lease predicate caps concurrent attempts on the
//! same row across workers.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::OrchestraConfig;
use crate::executor::Executor;
use crate::host::Service;
use crate::lease::LeaseManager;
use crate::registry::HandlerRegistry;
use crate::signal::WorkSignal;
use crate::store::CommandStore;

/// Polls the store for this worker's commands and executes them.
pub struct Worker<S: CommandStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: Arc<OrchestraConfig>,
    clock: Arc<dyn Clock>,
    signal: Arc<WorkSignal>,
}

impl<S: CommandStore + 'static> Worker<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        config: Arc<OrchestraConfig>,
        clock: Arc<dyn Clock>,
        signal: Arc<WorkSignal>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            clock,
            signal,
        }
    }
}

#[async_trait::async_trait]
impl<S: CommandStore + 'static> Service for Worker<S> {
    fn name(&self) -> &'static str {
        "command-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let config = &self.config;
        let lease = LeaseManager::new(self.store.clone(), config.lock_timeout_buffer);
        let executor = Arc::new(Executor::new(
            self.store.clone(),
            self.registry.clone(),
            config.clone(),
            self.clock.clone(),
        ));

        info!(
            instance_key = %config.instance_key,
            max_in_flight = config.max_in_flight,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "command worker starting"
        );

        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Reap finished executors
            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "executor task panicked");
                }
            }

            // Drain eligible rows up to capacity
            while in_flight.len() < config.max_in_flight && !shutdown.is_cancelled() {
                match lease.acquire(&config.instance_key).await {
                    Ok(Some(command)) => {
                        debug!(command_id = %command.id, name = %command.name, "command leased");
                        let executor = executor.clone();
                        let token = shutdown.clone();
                        in_flight.spawn(async move { executor.execute(command, token).await });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "failed to poll for commands");
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                        }
                        break;
                    }
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            // Idle until shutdown, new local work, the next poll tick, or a
            // freed execution slot
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        // Let in-flight executors attempt their terminal writes; they all
        // observe the shutdown token and wind down on their own.
        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "waiting for in-flight commands");
        }
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "executor task panicked");
            }
        }

        info!(instance_key = %config.instance_key, "command worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_worker_service_name() {
        let clock = Arc::new(ManualClock::default());
        let worker = Worker::new(
            Arc::new(crate::store::MemoryCommandStore::new(clock.clone())),
            Arc::new(HandlerRegistry::new()),
            Arc::new(OrchestraConfig::default()),
            clock,
            Arc::new(WorkSignal::new()),
        );
        assert_eq!(worker.name(), "command-worker");
    }
}
