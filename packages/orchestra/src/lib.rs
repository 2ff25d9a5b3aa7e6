//! # Orchestra
//!
//! A durable background-command orchestrator. Application code enqueues
//! typed command records into a shared Postgres table; worker processes
//! lease those records one row at a time, invoke the registered handler,
//! and persist the outcome. Commands get crash-safe at-least-once
//! execution, per-attempt timeouts, bounded retries, targeted routing to a
//! named worker, delayed execution, and chained follow-up commands.
//!
//! ## Architecture
//!
//! ```text
//! CommandQueue.enqueue() ──► Store (insert row) ──► WorkSignal
//!                                                       │
//!     ┌─────────────────────────────────────────────────┘
//!     ▼
//! Worker loop ──► LeaseManager.acquire() ──► Store (atomic claim)
//!     │
//!     └─► Executor ──► handler (registry lookup, cancellation + timeout)
//!             │             │
//!             │             └─ heartbeat ──► LeaseManager.extend()
//!             ▼
//!         Store (terminal update + chained successors, one transaction)
//! ```
//!
//! ## Key invariants
//!
//! 1. **The store is the only shared state**: workers coordinate purely
//!    through conditional single-row updates; there are no cross-process
//!    channels and no in-memory handoffs.
//! 2. **A row is decided exactly once**: at most one terminal flag, and
//!    every terminal update is guarded so late writers become no-ops.
//! 3. **Leases, not locks**: a crashed worker's rows come back when their
//!    leases expire; heartbeats keep live attempts held.
//! 4. **Successors ride the parent's transaction**: observers never see a
//!    decided parent without its chained rows.
//! 5. **At-least-once, not exactly-once**: a handler that ignores its
//!    cancellation token can outlive its lease and run in parallel with a
//!    re-leased attempt. Handlers own their idempotency.
//!
//! ## Example
//!
//! ```ignore
//! use orchestra::{
//!     HandlerRegistry, NewCommand, OrchestraConfig, OrchestraHost, PostgresCommandStore,
//! };
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct SendEmailCommand {
//!     to: String,
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_for(|cmd: SendEmailCommand, _cancel| async move {
//!     mailer.send(&cmd.to).await?;
//!     Ok(Some("sent".to_string()))
//! });
//!
//! let config = OrchestraConfig::from_env()?;
//! let store = Arc::new(
//!     PostgresCommandStore::connect(&database_url, &config.table_prefix, clock).await?,
//! );
//!
//! let host = OrchestraHost::with_system_clock(store, Arc::new(registry), config);
//! host.start();
//!
//! host.queue()
//!     .enqueue(NewCommand::of(&SendEmailCommand { to: "a@example.com".into() })?)
//!     .await?;
//! ```

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod lease;
pub mod name;
pub mod queue;
pub mod registry;
pub mod signal;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{CommandRecord, NewCommand, Outcome};
pub use config::OrchestraConfig;
pub use error::{HandlerError, OrchestraError};
pub use executor::Executor;
pub use host::{OrchestraHost, Service};
pub use lease::LeaseManager;
pub use name::{command_name_of, derive_command_name};
pub use queue::CommandQueue;
pub use registry::{ChainRules, HandlerRegistry, HandlerVerdict};
pub use signal::WorkSignal;
pub use store::{
    CommandStore, FailTransition, MemoryCommandStore, PostgresCommandStore, QueueStats,
};
pub use worker::Worker;
