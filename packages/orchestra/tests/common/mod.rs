#![allow(dead_code)]

//! Shared test harness.
//!
//! Tests run against the in-memory store with a manual clock, so scheduling
//! and lease expiry are exercised by advancing time instead of sleeping.
//! Handler timeouts still use the tokio timer, which is why timeout tests
//! pick short real durations.

use std::sync::Arc;
use std::time::Duration;

use orchestra::{
    CommandStore, Executor, HandlerRegistry, ManualClock, MemoryCommandStore, OrchestraConfig,
    OrchestraHost,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Initialize tracing for test output. Safe to call from every test.
///
/// Run with `RUST_LOG=debug cargo test -- --nocapture` to see the engine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One in-memory world: clock, store, and config wired together.
pub struct World {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryCommandStore>,
    pub config: Arc<OrchestraConfig>,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(OrchestraConfig::default())
    }

    pub fn with_config(config: OrchestraConfig) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryCommandStore::new(clock.clone()));
        Self {
            clock,
            store,
            config: Arc::new(config),
        }
    }

    /// Build an executor over this world.
    pub fn executor(&self, registry: Arc<HandlerRegistry>) -> Executor<MemoryCommandStore> {
        Executor::new(
            self.store.clone(),
            registry,
            self.config.clone(),
            self.clock.clone(),
        )
    }

    /// Build a host over this world. `host.queue()` is the enqueue path even
    /// when the worker loop is never started.
    pub fn host(&self, registry: Arc<HandlerRegistry>) -> OrchestraHost<MemoryCommandStore> {
        OrchestraHost::new(
            self.store.clone(),
            registry,
            (*self.config).clone(),
            self.clock.clone(),
        )
    }

    /// Lease and execute rows for `target` until the row `id` is terminal or
    /// `max_attempts` executions have run. Returns how many executions ran.
    pub async fn run_until_terminal(
        &self,
        executor: &Executor<MemoryCommandStore>,
        target: &str,
        id: Uuid,
        max_attempts: usize,
    ) -> usize {
        let mut executed = 0;
        for _ in 0..max_attempts {
            if self.store.get(id).map(|row| row.is_terminal()).unwrap_or(false) {
                break;
            }
            let Some(command) = self
                .store
                .acquire(target, self.config.lock_timeout_buffer)
                .await
                .unwrap()
            else {
                break;
            };
            executed += 1;
            executor.execute(command, CancellationToken::new()).await;
        }
        executed
    }

    /// Poll the store until `predicate` holds or `deadline` elapses.
    /// For tests that run a real worker loop in the background.
    pub async fn wait_for(
        &self,
        deadline: Duration,
        mut predicate: impl FnMut(&MemoryCommandStore) -> bool,
    ) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if predicate(&self.store) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        predicate(&self.store)
    }
}
