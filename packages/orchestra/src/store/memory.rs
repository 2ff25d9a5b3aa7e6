//! In-memory command store.
//!
//! Implements the same predicate semantics as the Postgres store over a
//! mutex-held map. Tests drive it with a [`ManualClock`](crate::clock::ManualClock)
//! to exercise scheduling and lease expiry without sleeping; it also works
//! as a real backend for single-process embedding where durability is not
//! needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{CommandStore, FailTransition, QueueStats};
use crate::clock::{to_chrono, Clock};
use crate::command::CommandRecord;

/// Mutex-held map of command rows keyed by id.
pub struct MemoryCommandStore {
    clock: Arc<dyn Clock>,
    rows: Mutex<HashMap<Uuid, CommandRecord>>,
}

impl MemoryCommandStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Copy of every row, for assertions.
    pub fn snapshot(&self) -> Vec<CommandRecord> {
        self.rows.lock().expect("store mutex poisoned").values().cloned().collect()
    }

    /// Copy of one row, for assertions.
    pub fn get(&self, id: Uuid) -> Option<CommandRecord> {
        self.rows.lock().expect("store mutex poisoned").get(&id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CommandRecord>> {
        self.rows.lock().expect("store mutex poisoned")
    }
}

#[async_trait::async_trait]
impl CommandStore for MemoryCommandStore {
    async fn insert(&self, row: &CommandRecord) -> Result<()> {
        let mut rows = self.lock();
        if rows.contains_key(&row.id) {
            anyhow::bail!("duplicate command id: {}", row.id);
        }
        rows.insert(row.id, row.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<CommandRecord>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn acquire(&self, target: &str, lease: Duration) -> Result<Option<CommandRecord>> {
        let now = self.clock.now();
        let mut rows = self.lock();

        // FIFO by scheduled_at, id as the stable tie-break
        let picked = rows
            .values()
            .filter(|r| r.target == target && r.is_eligible_at(now))
            .min_by_key(|r| (r.scheduled_at, r.id))
            .map(|r| r.id);

        let Some(id) = picked else {
            return Ok(None);
        };

        let row = rows.get_mut(&id).expect("picked row vanished under lock");
        row.is_running = true;
        row.running_at = Some(now);
        row.run_expires_at = Some(now + to_chrono(lease));
        Ok(Some(row.clone()))
    }

    async fn extend(&self, id: Uuid, lease: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut rows = self.lock();

        match rows.get_mut(&id) {
            Some(row) if row.is_running && row.run_expires_at.map(|e| e > now).unwrap_or(false) => {
                row.run_expires_at = Some(now + to_chrono(lease));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        output: Option<String>,
        successors: Vec<CommandRecord>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut rows = self.lock();

        let decided = match rows.get_mut(&id) {
            Some(row) if row.is_running && !row.is_completed => {
                row.is_running = false;
                row.run_expires_at = None;
                row.is_completed = true;
                row.completed_at = Some(now);
                row.output = output;
                true
            }
            _ => false,
        };

        if decided {
            for successor in successors {
                rows.insert(successor.id, successor);
            }
        }
        Ok(decided)
    }

    async fn cancel(&self, id: Uuid, successors: Vec<CommandRecord>) -> Result<bool> {
        let now = self.clock.now();
        let mut rows = self.lock();

        let decided = match rows.get_mut(&id) {
            Some(row) if row.is_running && !row.is_canceled => {
                row.is_running = false;
                row.run_expires_at = None;
                row.is_canceled = true;
                row.canceled_at = Some(now);
                true
            }
            _ => false,
        };

        if decided {
            for successor in successors {
                rows.insert(successor.id, successor);
            }
        }
        Ok(decided)
    }

    async fn fail(&self, id: Uuid, successors: Vec<CommandRecord>) -> Result<FailTransition> {
        let now = self.clock.now();
        let mut rows = self.lock();

        // Stage 1: release the lease, spend a retry
        let retries_left = match rows.get_mut(&id) {
            Some(row) if row.is_running && !row.is_completed => {
                row.is_running = false;
                row.run_expires_at = None;
                row.retries_left -= 1;
                row.retries_left
            }
            _ => return Ok(FailTransition::Superseded),
        };

        // Stage 2: terminal mark iff the budget is spent
        if retries_left == -1 {
            let row = rows.get_mut(&id).expect("row vanished under lock");
            if !row.is_failed {
                row.is_failed = true;
                row.failed_at = Some(now);
                for successor in successors {
                    rows.insert(successor.id, successor);
                }
            }
            return Ok(FailTransition::Failed);
        }

        Ok(FailTransition::Retrying { retries_left })
    }

    async fn cancel_pending(&self, id: Uuid) -> Result<bool> {
        let now = self.clock.now();
        let mut rows = self.lock();

        match rows.get_mut(&id) {
            Some(row) if !row.is_running && !row.is_terminal() => {
                row.is_canceled = true;
                row.canceled_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut rows = self.lock();

        let mut released = 0;
        for row in rows.values_mut() {
            if row.is_running && row.run_expires_at.map(|e| e <= now).unwrap_or(true) {
                row.is_running = false;
                row.running_at = None;
                row.run_expires_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|_, row| {
            let decided_at = if row.is_completed {
                row.completed_at
            } else if row.is_canceled {
                row.canceled_at
            } else if row.is_failed {
                row.failed_at
            } else {
                None
            };
            !matches!(decided_at, Some(at) if at < older_than)
        });
        Ok((before - rows.len()) as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = self.lock();
        let mut stats = QueueStats::default();
        for row in rows.values() {
            if row.is_completed {
                stats.completed += 1;
            } else if row.is_canceled {
                stats.canceled += 1;
            } else if row.is_failed {
                stats.failed += 1;
            } else if row.is_running {
                stats.running += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }
}
