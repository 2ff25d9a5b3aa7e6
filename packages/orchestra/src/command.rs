//! The command row model and the enqueue builder.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::to_chrono;
use crate::config::OrchestraConfig;
use crate::error::OrchestraError;
use crate::name::command_name_of;

/// One durable command row: the only persistent entity in the system.
///
/// A row is owned by whichever worker holds a fresh lease on it
/// (`is_running = true` and `run_expires_at` in the future); an expired
/// lease returns it to the pool. At most one of the three terminal flags is
/// ever set, and a terminal row is never mutated again except by garbage
/// collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    /// Unique id, assigned at enqueue (client-choosable).
    pub id: Uuid,
    /// Routes to a registered handler.
    pub name: String,
    /// Worker identity allowed to execute this row.
    pub target: String,
    /// Opaque input blob, if any.
    pub input: Option<String>,
    /// Opaque output blob, set on successful completion.
    pub output: Option<String>,
    /// Earliest instant the row is eligible for leasing.
    pub scheduled_at: DateTime<Utc>,
    /// Maximum single-attempt run time.
    pub timeout: Duration,
    /// Remaining retry budget; decremented on each non-success, −1 means
    /// exhausted.
    pub retries_left: i32,
    /// Lease held.
    pub is_running: bool,
    /// When the current attempt began.
    pub running_at: Option<DateTime<Utc>>,
    /// When the current lease expires.
    pub run_expires_at: Option<DateTime<Utc>>,
    /// Terminal success.
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal cancellation.
    pub is_canceled: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Terminal failure (retries exhausted).
    pub is_failed: bool,
    pub failed_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    /// True if any terminal flag is set.
    pub fn is_terminal(&self) -> bool {
        self.is_completed || self.is_canceled || self.is_failed
    }

    /// True if the row may be leased at `now`: due, non-terminal, and either
    /// not running or holding an expired lease.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal()
            && self.scheduled_at <= now
            && (!self.is_running || self.run_expires_at.map(|e| e < now).unwrap_or(true))
    }
}

/// Per-attempt classification produced by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler completed; carries the optional output blob.
    Success(Option<String>),
    /// The attempt was cancelled (worker shutdown or handler-initiated).
    Cancelled,
    /// The handler failed or its input could not be deserialized.
    Failed,
    /// No handler is registered under the command's name.
    NotFound,
    /// The attempt's timeout timer fired.
    TimedOut,
}

impl Outcome {
    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Cancelled => "cancelled",
            Outcome::Failed => "failed",
            Outcome::NotFound => "not_found",
            Outcome::TimedOut => "timed_out",
        }
    }
}

/// Builder for a command about to be enqueued.
///
/// Unset fields fall back to the worker configuration at enqueue time:
/// `target` to `instance_key`, `timeout` to `default_timeout`, `retries` to
/// `default_retries`.
///
/// # Example
///
/// ```
/// use orchestra::command::NewCommand;
/// use std::time::Duration;
///
/// let cmd = NewCommand::named("send_email")
///     .raw_input("{\"to\":\"a@example.com\"}")
///     .target("mailer")
///     .timeout(Duration::from_secs(5))
///     .retries(2)
///     .delay(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct NewCommand {
    id: Option<Uuid>,
    name: String,
    input: Option<String>,
    target: Option<String>,
    timeout: Option<Duration>,
    retries: Option<i32>,
    delay: Duration,
}

impl NewCommand {
    /// Start a command with an explicit name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            input: None,
            target: None,
            timeout: None,
            retries: None,
            delay: Duration::ZERO,
        }
    }

    /// Start a command from a typed value: the name is resolved from the
    /// type and the value becomes the JSON input blob.
    pub fn of<C: Serialize + 'static>(value: &C) -> Result<Self, OrchestraError> {
        Ok(Self::named(command_name_of::<C>()).raw_input(serde_json::to_string(value)?))
    }

    /// Use a caller-chosen id instead of a fresh v4.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Attach a pre-serialized input blob.
    pub fn raw_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Serialize a value as the input blob.
    pub fn input<T: Serialize>(mut self, value: &T) -> Result<Self, OrchestraError> {
        self.input = Some(serde_json::to_string(value)?);
        Ok(self)
    }

    /// Route to a specific worker identity.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Per-attempt timeout for this command.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry budget for this command.
    pub fn retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Delay before the row becomes eligible.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The command name this builder will enqueue under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Materialize the row, stamping defaults and `scheduled_at = now + delay`.
    pub fn into_record(self, config: &OrchestraConfig, now: DateTime<Utc>) -> CommandRecord {
        CommandRecord {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name,
            target: self.target.unwrap_or_else(|| config.instance_key.clone()),
            input: self.input,
            output: None,
            scheduled_at: now + to_chrono(self.delay),
            timeout: self.timeout.unwrap_or(config.default_timeout),
            // A negative budget would let the fail path decrement past −1
            retries_left: self.retries.unwrap_or(config.default_retries).max(0),
            is_running: false,
            running_at: None,
            run_expires_at: None,
            is_completed: false,
            completed_at: None,
            is_canceled: false,
            canceled_at: None,
            is_failed: false,
            failed_at: None,
        }
    }
}
