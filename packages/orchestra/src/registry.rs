//! Handler registry and chain rules.
//!
//! The registry maps command names (e.g. `"send_email"`) to:
//! - a handler closure that deserializes the input blob and runs the typed
//!   handler under the attempt's cancellation token, and
//! - the command's [`ChainRules`]: the successor commands to enqueue when a
//!   row reaches each terminal state.
//!
//! Registration happens once at startup; afterwards the registry is shared
//! immutably behind an `Arc`, so every worker process built from the same
//! code resolves the same handlers and the same chains.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//!
//! registry
//!     .register_for(|cmd: ProcessOrderCommand, _cancel| async move {
//!         fulfil(cmd).await?;
//!         Ok(Some("fulfilled".to_string()))
//!     })
//!     .on_success(NewCommand::named("send_email"))
//!     .on_failure(NewCommand::named("alert_ops"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::command::NewCommand;
use crate::error::HandlerError;
use crate::name::command_name_of;

/// What a single handler invocation reported.
///
/// The executor widens this to an [`Outcome`](crate::command::Outcome) by
/// attributing cancellations to their cause (timeout timer vs shutdown).
#[derive(Debug)]
pub enum HandlerVerdict {
    /// Completed; carries the optional output blob.
    Success { output: Option<String> },
    /// The handler stopped on its cancellation token.
    Cancelled,
    /// The handler failed, or its input could not be deserialized.
    Failed { error: String },
}

/// Type-erased handler: input blob + cancellation token in, verdict out.
type BoxedHandler = Box<
    dyn Fn(Option<String>, CancellationToken) -> Pin<Box<dyn Future<Output = HandlerVerdict> + Send>>
        + Send
        + Sync,
>;

/// Successor commands enqueued with a row's terminal transition.
///
/// Three collections, one per terminal state. When `on_cancellation` was
/// never set it mirrors `on_failure`; cancellation usually wants the same
/// compensation as failure, and callers who want different behavior say so.
#[derive(Default)]
pub struct ChainRules {
    on_success: Vec<NewCommand>,
    on_failure: Vec<NewCommand>,
    on_cancellation: Option<Vec<NewCommand>>,
}

impl ChainRules {
    /// Enqueue `cmd` when the row completes successfully.
    pub fn on_success(&mut self, cmd: NewCommand) -> &mut Self {
        self.on_success.push(cmd);
        self
    }

    /// Enqueue `cmd` when the row fails terminally (retries exhausted).
    pub fn on_failure(&mut self, cmd: NewCommand) -> &mut Self {
        self.on_failure.push(cmd);
        self
    }

    /// Enqueue `cmd` when the row is cancelled. Setting this (even to an
    /// explicitly empty set via `no_cancellation_chain`) stops the
    /// on_failure mirroring.
    pub fn on_cancellation(&mut self, cmd: NewCommand) -> &mut Self {
        self.on_cancellation.get_or_insert_with(Vec::new).push(cmd);
        self
    }

    /// Explicitly opt out of enqueueing anything on cancellation.
    pub fn no_cancellation_chain(&mut self) -> &mut Self {
        self.on_cancellation.get_or_insert_with(Vec::new);
        self
    }

    /// Successors for a successful completion.
    pub fn success_chain(&self) -> &[NewCommand] {
        &self.on_success
    }

    /// Successors for a terminal failure.
    pub fn failure_chain(&self) -> &[NewCommand] {
        &self.on_failure
    }

    /// Successors for a cancellation; defaults to the failure chain.
    pub fn cancellation_chain(&self) -> &[NewCommand] {
        self.on_cancellation.as_deref().unwrap_or(&self.on_failure)
    }
}

/// Registration entry: the handler plus its chain rules.
pub struct HandlerEntry {
    handler: BoxedHandler,
    chains: ChainRules,
}

impl HandlerEntry {
    /// Invoke the handler for one attempt.
    pub fn invoke(
        &self,
        input: Option<String>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = HandlerVerdict> + Send>> {
        (self.handler)(input, cancel)
    }

    /// The command's chain rules.
    pub fn chains(&self) -> &ChainRules {
        &self.chains
    }
}

/// Registry mapping command names to handlers and chain rules.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under an explicit name.
    ///
    /// The input blob is deserialized to `C` before the handler runs; a row
    /// with no input deserializes from JSON `null`, so commands without
    /// payloads use `C = ()`. A blob that does not parse becomes a `Failed`
    /// verdict without invoking the handler.
    ///
    /// Returns the entry's [`ChainRules`] for successor configuration.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered under `name`; duplicate
    /// registration is a wiring bug, caught at startup.
    pub fn register<C, F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut ChainRules
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(C, CancellationToken) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Option<String>, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        if self.entries.contains_key(&name) {
            panic!("handler already registered for command name: {}", name);
        }

        let type_name = name.clone();
        let boxed: BoxedHandler = Box::new(move |input, cancel| {
            let handler = handler.clone();
            let type_name = type_name.clone();
            Box::pin(async move {
                let raw = input.as_deref().unwrap_or("null");
                let command: C = match serde_json::from_str(raw) {
                    Ok(command) => command,
                    Err(e) => {
                        return HandlerVerdict::Failed {
                            error: format!("failed to deserialize {} input: {}", type_name, e),
                        };
                    }
                };

                match handler(command, cancel).await {
                    Ok(output) => HandlerVerdict::Success { output },
                    Err(HandlerError::Cancelled) => HandlerVerdict::Cancelled,
                    Err(HandlerError::Other(e)) => HandlerVerdict::Failed {
                        error: format!("{:#}", e),
                    },
                }
            })
        });

        &mut self
            .entries
            .entry(name)
            .or_insert(HandlerEntry {
                handler: boxed,
                chains: ChainRules::default(),
            })
            .chains
    }

    /// Register a typed handler under the name derived from `C`
    /// (`SendEmailCommand` → `"send_email"`).
    pub fn register_for<C, F, Fut>(&mut self, handler: F) -> &mut ChainRules
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(C, CancellationToken) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Option<String>, HandlerError>> + Send + 'static,
    {
        self.register(command_name_of::<C>(), handler)
    }

    /// Look up the entry for a command name.
    pub fn get(&self, name: &str) -> Option<&HandlerEntry> {
        self.entries.get(name)
    }

    /// Check whether a name is registered.
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, for startup logging.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_names", &self.names())
            .finish()
    }
}
