//! Structured error types.
//!
//! `anyhow::Error` is the internal transport inside the store and handler
//! plumbing; `OrchestraError` is what crosses the public API boundary, and
//! `HandlerError` is how a handler distinguishes "I failed" from "I observed
//! cancellation".

use thiserror::Error;

/// Errors surfaced by the public API (enqueue, host wiring).
///
/// Execution-time failures never appear here: every handler error, timeout,
/// or lost lease is recovered locally into a row transition, and the only
/// user-visible record of it is the row's flags in the store.
#[derive(Debug, Error)]
pub enum OrchestraError {
    /// A command input could not be serialized at enqueue time.
    #[error("failed to serialize command input: {0}")]
    InputSerialization(#[from] serde_json::Error),

    /// A store operation failed; the condition is assumed transient and the
    /// caller may simply retry.
    #[error("store operation failed: {0}")]
    Store(#[source] anyhow::Error),
}

/// Error type a handler returns from an attempt.
///
/// Returning `Cancelled` reports that the handler observed its cancellation
/// token and stopped; the executor then decides whether that was a timeout,
/// a worker shutdown, or a handler-initiated cancel. Any other error becomes
/// a `Failed` outcome and rides the retry path.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler stopped because its cancellation token fired.
    #[error("handler observed cancellation")]
    Cancelled,

    /// The handler failed; the attempt is retried while retries remain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
