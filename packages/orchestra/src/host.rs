//! Host: supervised start/stop of the worker loop.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::OrchestraConfig;
use crate::queue::CommandQueue;
use crate::registry::HandlerRegistry;
use crate::signal::WorkSignal;
use crate::store::CommandStore;
use crate::worker::Worker;

/// A long-running background service driven by a shutdown token.
#[async_trait::async_trait]
pub trait Service: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run until `shutdown` fires, then wind down and return.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Owns one worker loop as a supervised background task.
///
/// `start` and `stop` are idempotent: repeated starts are no-ops while the
/// worker runs, repeated stops after the first are no-ops. On stop the
/// worker stops polling, in-flight executors attempt their terminal writes,
/// and `stop` returns once they have.
///
/// # Example
///
/// ```ignore
/// let host = OrchestraHost::new(store, registry, config, clock);
/// host.start();
///
/// host.queue().enqueue(NewCommand::named("send_email")).await?;
///
/// host.stop().await;
/// ```
pub struct OrchestraHost<S: CommandStore + 'static> {
    queue: CommandQueue<S>,
    worker: Mutex<Option<Worker<S>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CommandStore + 'static> OrchestraHost<S> {
    /// Wire a host from its parts.
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        config: OrchestraConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let signal = Arc::new(WorkSignal::new());
        let queue = CommandQueue::new(store.clone(), config.clone(), clock.clone(), signal.clone());
        let worker = Worker::new(store, registry, config, clock, signal);

        Self {
            queue,
            worker: Mutex::new(Some(worker)),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Wire a host on the system clock.
    pub fn with_system_clock(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        config: OrchestraConfig,
    ) -> Self {
        Self::new(store, registry, config, Arc::new(SystemClock))
    }

    /// The enqueue API bound to this host's store and wake signal.
    pub fn queue(&self) -> &CommandQueue<S> {
        &self.queue
    }

    /// Start the worker loop. A second call while running is a no-op, as is
    /// a call after `stop`.
    pub fn start(&self) {
        let mut task = self.task.lock().expect("host mutex poisoned");
        if task.is_some() {
            debug!("worker already running, start ignored");
            return;
        }

        let Some(worker) = self.worker.lock().expect("host mutex poisoned").take() else {
            warn!("host already stopped, start ignored");
            return;
        };

        let name = worker.name();
        let shutdown = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            if let Err(e) = Box::new(worker).run(shutdown).await {
                error!(service = name, error = %e, "service exited with error");
            }
        }));
        info!(service = name, "service started");
    }

    /// Signal shutdown and wait for the worker to drain. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let task = self.task.lock().expect("host mutex poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}
