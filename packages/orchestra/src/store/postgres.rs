//! PostgreSQL command store.
//!
//! # Database schema
//!
//! With the default table prefix the table is `ORCH_commands` (Postgres
//! folds the unquoted name to `orch_commands`):
//!
//! ```sql
//! CREATE TABLE ORCH_commands (
//!     id UUID PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     target TEXT NOT NULL,
//!     input TEXT,
//!     output TEXT,
//!     scheduled_at TIMESTAMPTZ NOT NULL,
//!     timeout INTERVAL NOT NULL,
//!     retries_left INTEGER NOT NULL,
//!     is_running BOOLEAN NOT NULL DEFAULT FALSE,
//!     running_at TIMESTAMPTZ,
//!     run_expires_at TIMESTAMPTZ,
//!     is_completed BOOLEAN NOT NULL DEFAULT FALSE,
//!     completed_at TIMESTAMPTZ,
//!     is_canceled BOOLEAN NOT NULL DEFAULT FALSE,
//!     canceled_at TIMESTAMPTZ,
//!     is_failed BOOLEAN NOT NULL DEFAULT FALSE,
//!     failed_at TIMESTAMPTZ
//! );
//! CREATE INDEX ... ON ORCH_commands (target);
//! CREATE INDEX ... ON ORCH_commands (is_running);
//! CREATE INDEX ... ON ORCH_commands (is_completed);
//! CREATE INDEX ... ON ORCH_commands (is_failed);
//! ```
//!
//! The hot claim query is a CTE with `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers never block each other on the same row and a lost race surfaces
//! as "nothing returned" rather than an error. Terminal transitions and
//! their successor inserts share one transaction.
//!
//! Timestamps are bound from the injected [`Clock`] instead of SQL `NOW()`
//! so the full protocol is drivable from tests with a manual clock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{CommandStore, FailTransition, QueueStats};
use crate::clock::{to_chrono, Clock};
use crate::command::CommandRecord;

const COLUMNS: &str = "id, name, target, input, output, scheduled_at, timeout, retries_left, \
     is_running, running_at, run_expires_at, is_completed, completed_at, \
     is_canceled, canceled_at, is_failed, failed_at";

/// Command store backed by a PostgreSQL table.
#[derive(Clone)]
pub struct PostgresCommandStore {
    pool: PgPool,
    table: String,
    clock: Arc<dyn Clock>,
}

impl PostgresCommandStore {
    /// Create a store over an existing pool. The table is
    /// `{table_prefix}commands`.
    pub fn new(pool: PgPool, table_prefix: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            table: format!("{}commands", table_prefix),
            clock,
        }
    }

    /// Connect to `database_url` and create a store.
    pub async fn connect(
        database_url: &str,
        table_prefix: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self::new(pool, table_prefix, clock))
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// DDL for this store's table and indexes.
    ///
    /// Deployments normally own their migrations; this exists for tests and
    /// bootstrap scripts.
    pub fn schema(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                target TEXT NOT NULL,
                input TEXT,
                output TEXT,
                scheduled_at TIMESTAMPTZ NOT NULL,
                timeout INTERVAL NOT NULL,
                retries_left INTEGER NOT NULL,
                is_running BOOLEAN NOT NULL DEFAULT FALSE,
                running_at TIMESTAMPTZ,
                run_expires_at TIMESTAMPTZ,
                is_completed BOOLEAN NOT NULL DEFAULT FALSE,
                completed_at TIMESTAMPTZ,
                is_canceled BOOLEAN NOT NULL DEFAULT FALSE,
                canceled_at TIMESTAMPTZ,
                is_failed BOOLEAN NOT NULL DEFAULT FALSE,
                failed_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_target ON {table} (target);
            CREATE INDEX IF NOT EXISTS idx_{table}_is_running ON {table} (is_running);
            CREATE INDEX IF NOT EXISTS idx_{table}_is_completed ON {table} (is_completed);
            CREATE INDEX IF NOT EXISTS idx_{table}_is_failed ON {table} (is_failed);
            "#,
            table = self.table,
        )
    }

    /// Apply [`schema`](Self::schema) to the pool.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(&self.schema())
            .execute(&self.pool)
            .await
            .context("failed to apply command table schema")?;
        Ok(())
    }

    async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &CommandRecord,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            table = self.table,
        );
        bind_record(sqlx::query(&sql), row).execute(&mut **tx).await?;
        Ok(())
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    row: &'q CommandRecord,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.target)
        .bind(&row.input)
        .bind(&row.output)
        .bind(row.scheduled_at)
        .bind(duration_to_interval(row.timeout))
        .bind(row.retries_left)
        .bind(row.is_running)
        .bind(row.running_at)
        .bind(row.run_expires_at)
        .bind(row.is_completed)
        .bind(row.completed_at)
        .bind(row.is_canceled)
        .bind(row.canceled_at)
        .bind(row.is_failed)
        .bind(row.failed_at)
}

fn record_from_row(row: &PgRow) -> Result<CommandRecord> {
    Ok(CommandRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        target: row.try_get("target")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        scheduled_at: row.try_get("scheduled_at")?,
        timeout: interval_to_duration(&row.try_get::<PgInterval, _>("timeout")?)?,
        retries_left: row.try_get("retries_left")?,
        is_running: row.try_get("is_running")?,
        running_at: row.try_get("running_at")?,
        run_expires_at: row.try_get("run_expires_at")?,
        is_completed: row.try_get("is_completed")?,
        completed_at: row.try_get("completed_at")?,
        is_canceled: row.try_get("is_canceled")?,
        canceled_at: row.try_get("canceled_at")?,
        is_failed: row.try_get("is_failed")?,
        failed_at: row.try_get("failed_at")?,
    })
}

/// Encode a duration as a whole-microsecond interval. Day and month parts
/// are never written, which keeps the reverse conversion exact.
fn duration_to_interval(d: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: i64::try_from(d.as_micros()).unwrap_or(i64::MAX),
    }
}

fn interval_to_duration(interval: &PgInterval) -> Result<Duration> {
    if interval.months != 0 {
        bail!("command timeout interval uses months, which have no fixed length");
    }
    let micros = (interval.days as i64)
        .checked_mul(86_400_000_000)
        .and_then(|day_us| day_us.checked_add(interval.microseconds))
        .context("command timeout interval overflows")?;
    if micros < 0 {
        bail!("command timeout interval is negative");
    }
    Ok(Duration::from_micros(micros as u64))
}

#[async_trait::async_trait]
impl CommandStore for PostgresCommandStore {
    async fn insert(&self, row: &CommandRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            table = self.table,
        );
        bind_record(sqlx::query(&sql), row).execute(&self.pool).await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<CommandRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM {table} WHERE id = $1", table = self.table);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn acquire(&self, target: &str, lease: Duration) -> Result<Option<CommandRecord>> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(lease);

        let sql = format!(
            r#"
            WITH next_command AS (
                SELECT id
                FROM {table}
                WHERE target = $1
                  AND scheduled_at <= $2
                  AND NOT is_completed AND NOT is_canceled AND NOT is_failed
                  AND (is_running = FALSE OR run_expires_at < $2)
                ORDER BY scheduled_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} AS c
            SET is_running = TRUE,
                running_at = $2,
                run_expires_at = $3
            FROM next_command
            WHERE c.id = next_command.id
            RETURNING c.id, c.name, c.target, c.input, c.output, c.scheduled_at,
                      c.timeout, c.retries_left, c.is_running, c.running_at,
                      c.run_expires_at, c.is_completed, c.completed_at,
                      c.is_canceled, c.canceled_at, c.is_failed, c.failed_at
            "#,
            table = self.table,
        );

        let row = sqlx::query(&sql)
            .bind(target)
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn extend(&self, id: Uuid, lease: Duration) -> Result<bool> {
        let now = self.clock.now();
        let sql = format!(
            "UPDATE {table} SET run_expires_at = $3 \
             WHERE id = $1 AND is_running AND run_expires_at > $2",
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .bind(now + to_chrono(lease))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: Uuid,
        output: Option<String>,
        successors: Vec<CommandRecord>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE {table} \
             SET is_completed = TRUE, completed_at = $2, output = $3, \
                 is_running = FALSE, run_expires_at = NULL \
             WHERE id = $1 AND is_running AND NOT is_completed",
            table = self.table,
        );
        let decided = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .bind(&output)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;

        if decided {
            for successor in &successors {
                self.insert_in_tx(&mut tx, successor).await?;
            }
        }
        tx.commit().await?;
        Ok(decided)
    }

    async fn cancel(&self, id: Uuid, successors: Vec<CommandRecord>) -> Result<bool> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE {table} \
             SET is_canceled = TRUE, canceled_at = $2, \
                 is_running = FALSE, run_expires_at = NULL \
             WHERE id = $1 AND is_running AND NOT is_canceled",
            table = self.table,
        );
        let decided = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;

        if decided {
            for successor in &successors {
                self.insert_in_tx(&mut tx, successor).await?;
            }
        }
        tx.commit().await?;
        Ok(decided)
    }

    async fn fail(&self, id: Uuid, successors: Vec<CommandRecord>) -> Result<FailTransition> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        // Stage 1: release the lease, spend a retry
        let sql = format!(
            "UPDATE {table} \
             SET is_running = FALSE, run_expires_at = NULL, \
                 retries_left = retries_left - 1 \
             WHERE id = $1 AND is_running AND NOT is_completed \
             RETURNING retries_left",
            table = self.table,
        );
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&mut *tx).await? else {
            tx.commit().await?;
            return Ok(FailTransition::Superseded);
        };
        let retries_left: i32 = row.try_get("retries_left")?;

        // Stage 2: terminal mark iff the budget is spent. The closed-form
        // predicate keeps this a pure conditional update, no read-then-write.
        let sql = format!(
            "UPDATE {table} SET is_failed = TRUE, failed_at = $2 \
             WHERE id = $1 AND NOT is_failed AND retries_left = -1",
            table = self.table,
        );
        let failed = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;

        if failed {
            for successor in &successors {
                self.insert_in_tx(&mut tx, successor).await?;
            }
        }
        tx.commit().await?;

        if failed {
            Ok(FailTransition::Failed)
        } else {
            Ok(FailTransition::Retrying { retries_left })
        }
    }

    async fn cancel_pending(&self, id: Uuid) -> Result<bool> {
        let now = self.clock.now();
        let sql = format!(
            "UPDATE {table} SET is_canceled = TRUE, canceled_at = $2 \
             WHERE id = $1 AND NOT is_running \
               AND NOT is_completed AND NOT is_canceled AND NOT is_failed",
            table = self.table,
        );
        let result = sqlx::query(&sql).bind(id).bind(now).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let sql = format!(
            "UPDATE {table} \
             SET is_running = FALSE, running_at = NULL, run_expires_at = NULL \
             WHERE is_running AND (run_expires_at IS NULL OR run_expires_at <= $1)",
            table = self.table,
        );
        let result = sqlx::query(&sql).bind(now).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} \
             WHERE (is_completed AND completed_at < $1) \
                OR (is_canceled AND canceled_at < $1) \
                OR (is_failed AND failed_at < $1)",
            table = self.table,
        );
        let result = sqlx::query(&sql).bind(older_than).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let sql = format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE NOT is_running AND NOT is_completed
                                   AND NOT is_canceled AND NOT is_failed) AS pending,
                COUNT(*) FILTER (WHERE is_running) AS running,
                COUNT(*) FILTER (WHERE is_completed) AS completed,
                COUNT(*) FILTER (WHERE is_canceled) AS canceled,
                COUNT(*) FILTER (WHERE is_failed) AS failed
            FROM {table}
            "#,
            table = self.table,
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(QueueStats {
            pending: row.try_get("pending")?,
            running: row.try_get("running")?,
            completed: row.try_get("completed")?,
            canceled: row.try_get("canceled")?,
            failed: row.try_get("failed")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_interval_round_trip() {
        for d in [
            Duration::ZERO,
            Duration::from_millis(1),
            Duration::from_secs(60),
            Duration::from_secs(86_400 * 3),
        ] {
            let interval = duration_to_interval(d);
            assert_eq!(interval.months, 0);
            assert_eq!(interval.days, 0);
            assert_eq!(interval_to_duration(&interval).unwrap(), d);
        }
    }

    #[test]
    fn test_interval_with_days_decodes() {
        let interval = PgInterval {
            months: 0,
            days: 2,
            microseconds: 500_000,
        };
        assert_eq!(
            interval_to_duration(&interval).unwrap(),
            Duration::from_secs(2 * 86_400) + Duration::from_millis(500)
        );
    }

    #[test]
    fn test_interval_with_months_rejected() {
        let interval = PgInterval {
            months: 1,
            days: 0,
            microseconds: 0,
        };
        assert!(interval_to_duration(&interval).is_err());
    }

    #[test]
    fn test_negative_interval_rejected() {
        let interval = PgInterval {
            months: 0,
            days: 0,
            microseconds: -1,
        };
        assert!(interval_to_duration(&interval).is_err());
    }

    #[tokio::test]
    async fn test_table_name_uses_prefix() {
        // Constructing the store needs no live connection
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let store =
            PostgresCommandStore::new(pool, "ORCH_", Arc::new(crate::clock::SystemClock));
        assert!(store.schema().contains("ORCH_commands"));
    }
}
