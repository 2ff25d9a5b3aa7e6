//! Per-command execution.
//!
//! One [`Executor`] call drives one leased row to a terminal state:
//!
//! ```text
//! lease ─► handler (under timeout + shutdown cancellation)
//!   │          │
//!   │          ├─ heartbeat extends the lease every half lease
//!   │          ▼
//!   └──► classify outcome ─► terminal write + chained successors
//! ```
//!
//! The terminal write runs with no cancellation attached: a shutting-down
//! worker still records what happened. If the write's guard matches nothing
//! the row was superseded (lease expired and re-leased elsewhere), which is
//! logged and otherwise ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::command::{CommandRecord, NewCommand, Outcome};
use crate::config::OrchestraConfig;
use crate::lease::LeaseManager;
use crate::registry::{HandlerRegistry, HandlerVerdict};
use crate::store::{CommandStore, FailTransition};

/// Executes leased commands against the registry and writes their terminal
/// transitions.
pub struct Executor<S: CommandStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    lease: LeaseManager<S>,
    clock: Arc<dyn Clock>,
    config: Arc<OrchestraConfig>,
}

impl<S: CommandStore + 'static> Executor<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        config: Arc<OrchestraConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let lease = LeaseManager::new(store.clone(), config.lock_timeout_buffer);
        Self {
            store,
            registry,
            lease,
            clock,
            config,
        }
    }

    /// Drive one leased command to a terminal state.
    ///
    /// `shutdown` is the worker's token; the attempt runs under a child of
    /// it so shutdown cancels the handler but not the terminal write.
    pub async fn execute(&self, command: CommandRecord, shutdown: CancellationToken) {
        let id = command.id;
        let attempt = shutdown.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));

        // Timeout timer, scoped to this attempt only. The flag is set before
        // the cancel so classification can attribute the cancellation.
        let timer = tokio::spawn({
            let attempt = attempt.clone();
            let timed_out = timed_out.clone();
            let timeout = command.timeout;
            async move {
                tokio::select! {
                    _ = attempt.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        timed_out.store(true, Ordering::SeqCst);
                        attempt.cancel();
                    }
                }
            }
        });

        let heartbeat = tokio::spawn({
            let lease = self.lease.clone();
            let attempt = attempt.clone();
            async move { lease.heartbeat(id, attempt).await }
        });

        let entry = self.registry.get(&command.name);
        let verdict = match entry {
            None => None,
            Some(entry) => {
                // Spawned so a panicking handler is contained and classified
                let invocation = entry.invoke(command.input.clone(), attempt.clone());
                match tokio::spawn(invocation).await {
                    Ok(verdict) => Some(verdict),
                    Err(join_error) => Some(HandlerVerdict::Failed {
                        error: format!("handler panicked: {}", join_error),
                    }),
                }
            }
        };

        // Attribute the outcome before tearing the attempt down, so the
        // timer cannot fire in between and muddy the classification.
        let outcome = classify(verdict, &timed_out, &attempt, &shutdown);

        attempt.cancel();
        let _ = heartbeat.await;
        let _ = timer.await;

        self.write_terminal(&command, outcome).await;
    }

    /// Write the terminal transition for `outcome`, enqueueing the command's
    /// chained successors with it.
    async fn write_terminal(&self, command: &CommandRecord, outcome: Outcome) {
        let id = command.id;
        let name = command.name.as_str();
        let chains = self.registry.get(name).map(|entry| entry.chains());

        match outcome {
            Outcome::Success(output) => {
                let successors =
                    self.materialize(chains.map(|c| c.success_chain()).unwrap_or_default());
                match self.store.complete(id, output, successors).await {
                    Ok(true) => info!(command_id = %id, name, "command completed"),
                    Ok(false) => {
                        debug!(command_id = %id, name, "completion superseded, row already decided")
                    }
                    Err(e) => error!(command_id = %id, name, error = %e, "failed to record completion"),
                }
            }
            Outcome::Cancelled => {
                let successors =
                    self.materialize(chains.map(|c| c.cancellation_chain()).unwrap_or_default());
                match self.store.cancel(id, successors).await {
                    Ok(true) => info!(command_id = %id, name, "command cancelled"),
                    Ok(false) => {
                        debug!(command_id = %id, name, "cancellation superseded, row already decided")
                    }
                    Err(e) => error!(command_id = %id, name, error = %e, "failed to record cancellation"),
                }
            }
            Outcome::Failed | Outcome::NotFound | Outcome::TimedOut => {
                let tag = outcome.tag();
                let successors =
                    self.materialize(chains.map(|c| c.failure_chain()).unwrap_or_default());
                match self.store.fail(id, successors).await {
                    Ok(FailTransition::Retrying { retries_left }) => {
                        warn!(command_id = %id, name, outcome = tag, retries_left, "attempt failed, will retry")
                    }
                    Ok(FailTransition::Failed) => {
                        warn!(command_id = %id, name, outcome = tag, "command failed terminally")
                    }
                    Ok(FailTransition::Superseded) => {
                        debug!(command_id = %id, name, outcome = tag, "failure superseded, row already decided")
                    }
                    Err(e) => error!(command_id = %id, name, error = %e, "failed to record failure"),
                }
            }
        }
    }

    fn materialize(&self, chain: &[NewCommand]) -> Vec<CommandRecord> {
        let now = self.clock.now();
        chain
            .iter()
            .cloned()
            .map(|cmd| cmd.into_record(&self.config, now))
            .collect()
    }
}

/// Map a handler verdict (or a missing handler) to the attempt's outcome.
///
/// Cancellations are attributed by cause: the timeout timer flags itself
/// before cancelling, so a set flag means `TimedOut`; otherwise a cancelled
/// attempt under a cancelled shutdown token means `Cancelled`. A handler
/// that reports `Cancelled` with neither cause fired initiated the cancel
/// itself and is taken at its word.
fn classify(
    verdict: Option<HandlerVerdict>,
    timed_out: &AtomicBool,
    attempt: &CancellationToken,
    shutdown: &CancellationToken,
) -> Outcome {
    let Some(verdict) = verdict else {
        return Outcome::NotFound;
    };

    let interrupted = attempt.is_cancelled() && !matches!(verdict, HandlerVerdict::Success { .. });
    if interrupted {
        if timed_out.load(Ordering::SeqCst) {
            return Outcome::TimedOut;
        }
        if shutdown.is_cancelled() {
            return Outcome::Cancelled;
        }
    }

    match verdict {
        HandlerVerdict::Success { output } => Outcome::Success(output),
        HandlerVerdict::Cancelled => Outcome::Cancelled,
        HandlerVerdict::Failed { error } => {
            debug!(error = %error, "handler reported failure");
            Outcome::Failed
        }
    }
}
