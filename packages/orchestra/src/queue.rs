//! The enqueue API.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::command::{CommandRecord, NewCommand};
use crate::config::OrchestraConfig;
use crate::error::OrchestraError;
use crate::signal::WorkSignal;
use crate::store::{CommandStore, QueueStats};

/// Writes new command rows and wakes the local worker.
///
/// Cloneable and cheap to pass around; application code holds one of these
/// and never touches the store directly.
///
/// # Example
///
/// ```ignore
/// let id = queue
///     .enqueue(NewCommand::named("send_email").raw_input(payload))
///     .await?;
/// ```
pub struct CommandQueue<S: CommandStore> {
    store: Arc<S>,
    config: Arc<OrchestraConfig>,
    clock: Arc<dyn Clock>,
    signal: Arc<WorkSignal>,
}

impl<S: CommandStore> Clone for CommandQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            signal: self.signal.clone(),
        }
    }
}

impl<S: CommandStore> CommandQueue<S> {
    pub(crate) fn new(
        store: Arc<S>,
        config: Arc<OrchestraConfig>,
        clock: Arc<dyn Clock>,
        signal: Arc<WorkSignal>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            signal,
        }
    }

    /// Insert a fresh command row and wake the local worker.
    ///
    /// Unset builder fields take this process's configured defaults, and
    /// `scheduled_at` becomes `now + delay`. Returns the new row's id.
    pub async fn enqueue(&self, command: NewCommand) -> Result<Uuid, OrchestraError> {
        let record = command.into_record(&self.config, self.clock.now());
        self.store
            .insert(&record)
            .await
            .map_err(OrchestraError::Store)?;
        self.signal.notify();

        info!(
            command_id = %record.id,
            name = %record.name,
            target = %record.target,
            scheduled_at = %record.scheduled_at,
            "command enqueued"
        );
        Ok(record.id)
    }

    /// Point lookup of a command row, for status queries.
    pub async fn find(&self, id: Uuid) -> Result<Option<CommandRecord>, OrchestraError> {
        self.store.find(id).await.map_err(OrchestraError::Store)
    }

    /// Cancel a command that has not started running. Returns `false` when
    /// the row is already leased or decided.
    pub async fn cancel_pending(&self, id: Uuid) -> Result<bool, OrchestraError> {
        self.store
            .cancel_pending(id)
            .await
            .map_err(OrchestraError::Store)
    }

    /// Queue health counters.
    pub async fn stats(&self) -> Result<QueueStats, OrchestraError> {
        self.store.stats().await.map_err(OrchestraError::Store)
    }
}
