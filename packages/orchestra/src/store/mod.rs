//! Durable command storage.
//!
//! The store is the only shared state between workers; all coordination
//! happens through conditional single-row updates on the commands table.
//! [`CommandStore`] is the contract, [`postgres::PostgresCommandStore`] the
//! production implementation, [`memory::MemoryCommandStore`] the in-memory
//! one used by tests and embeddable for local runs.
//!
//! Failure semantics: transient errors bubble up as `anyhow::Error`; callers
//! retry on their next poll cycle. The store itself never retries.

mod memory;
mod postgres;

pub use memory::MemoryCommandStore;
pub use postgres::PostgresCommandStore;

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::command::CommandRecord;

/// What a `fail` call did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailTransition {
    /// Retry budget remained: the row is pending again with one fewer retry.
    Retrying {
        /// The row's `retries_left` after the decrement.
        retries_left: i32,
    },
    /// The decrement exhausted the budget: the row is terminally failed and
    /// any on-failure successors were inserted with it.
    Failed,
    /// The guard matched no row: the lease was lost or the row already
    /// reached a terminal state. Nothing was written.
    Superseded,
}

/// Queue health counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub canceled: i64,
    pub failed: i64,
}

/// Contract for the durable command table.
///
/// Every mutating operation is a conditional update whose predicate encodes
/// the state machine: a call that matches zero rows is a benign no-op (the
/// caller lost a race), never an error. Terminal transitions insert their
/// successor rows in the same transaction, so observers never see a decided
/// parent without its successors.
#[async_trait::async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert a freshly enqueued row.
    async fn insert(&self, row: &CommandRecord) -> Result<()>;

    /// Point lookup by id.
    async fn find(&self, id: Uuid) -> Result<Option<CommandRecord>>;

    /// Atomically lease one eligible row for `target`.
    ///
    /// Eligible means: matching target, due (`scheduled_at <= now`),
    /// non-terminal, and either not running or holding an expired lease.
    /// Ties break FIFO by `scheduled_at`. Returns `None` when nothing is
    /// eligible or the race was lost; the caller's poll loop retries.
    async fn acquire(&self, target: &str, lease: Duration) -> Result<Option<CommandRecord>>;

    /// Extend a held lease. Returns `false` when the lease was already lost
    /// (expired or re-leased elsewhere); the caller must stop heartbeating.
    async fn extend(&self, id: Uuid, lease: Duration) -> Result<bool>;

    /// Terminal success: set `is_completed` and the output, clear the lease,
    /// and insert `successors`, all in one transaction. Guarded by
    /// `is_running AND NOT is_completed`; returns whether a row was decided.
    async fn complete(
        &self,
        id: Uuid,
        output: Option<String>,
        successors: Vec<CommandRecord>,
    ) -> Result<bool>;

    /// Terminal cancellation of a running row, inserting `successors` with
    /// it. Guarded by `is_running AND NOT is_canceled`.
    async fn cancel(&self, id: Uuid, successors: Vec<CommandRecord>) -> Result<bool>;

    /// Failure path, two conditional updates in one transaction:
    /// first release the lease and decrement `retries_left` (guarded by
    /// `is_running AND NOT is_completed`), then mark the row failed iff the
    /// decrement reached −1. `successors` are inserted only with the
    /// terminal mark.
    async fn fail(&self, id: Uuid, successors: Vec<CommandRecord>) -> Result<FailTransition>;

    /// Terminal cancellation of a row that was never leased. No successors:
    /// nothing ran, so there is no outcome to chain from.
    async fn cancel_pending(&self, id: Uuid) -> Result<bool>;

    /// Operator sweep: return every expired lease to the pool. Workers do
    /// not need this (the acquire predicate already re-leases expired rows);
    /// it exists to make stuck rows visible as pending again.
    async fn release_expired(&self) -> Result<u64>;

    /// Garbage-collect terminal rows older than the given instant.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Queue health counters.
    async fn stats(&self) -> Result<QueueStats>;
}
