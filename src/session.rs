//! Session module
//!
//! Provides the [`Session`] trait: everything the lock manager, the ledger and
//! the executors need from one database session. [`PgSession`] implements it
//! over `may_postgres::Client`.
//!
//! Advisory locks taken through a session are session-scoped. When the
//! session's connection closes, PostgreSQL releases them, which is what makes
//! an interrupted migration run recoverable without any cleanup job.

use crate::migration::ledger::{self, LedgerTable};
use crate::migration::record::{AppliedFrom, LedgerEntry, NewLedgerEntry};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use may_postgres::{Client, Row};
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Database error type
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] may_postgres::Error),
    /// Malformed connection string
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
    /// Query execution error
    #[error("Query error: {0}")]
    Query(String),
    /// Row parsing/conversion error
    #[error("Parse error: {0}")]
    Parse(String),
    /// Other execution errors
    #[error("Execution error: {0}")]
    Other(String),
}

/// One database session
///
/// Implementations hold exactly one connection. All advisory-lock operations
/// refer to locks held by *this* session.
pub trait Session {
    /// Execute one or more statements using the simple query protocol
    ///
    /// # Errors
    ///
    /// Returns `DbError` if any statement fails.
    fn batch_execute(&self, sql: &str) -> Result<(), DbError>;

    /// Execute a full migration body as a single transaction
    ///
    /// The transaction is rolled back if any statement fails.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing statement.
    fn execute_script(&self, sql: &str) -> Result<(), DbError>;

    /// Non-blocking attempt to take the advisory lock `lock_id`
    ///
    /// Returns `Ok(false)` when another session holds it. `timeout` bounds how
    /// long the server may spend on the call itself.
    ///
    /// # Errors
    ///
    /// Returns `DbError` only when the call fails, never for contention.
    fn try_advisory_lock(&self, lock_id: i64, timeout: Duration) -> Result<bool, DbError>;

    /// Release the advisory lock `lock_id`
    ///
    /// Returns `Ok(false)` when this session did not hold the lock.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the unlock call fails.
    fn advisory_unlock(&self, lock_id: i64) -> Result<bool, DbError>;

    /// Number of sessions (any session) currently holding `lock_id`
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the lock catalog cannot be read.
    fn advisory_lock_holders(&self, lock_id: i64) -> Result<i64, DbError>;

    /// Whether `schema.table` exists
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the catalog query fails.
    fn table_exists(&self, schema: &str, table: &str) -> Result<bool, DbError>;

    /// Create the ledger table and its indexes if they are absent
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the DDL fails.
    fn ensure_ledger(&self, table: &LedgerTable) -> Result<(), DbError>;

    /// Append an entry to the ledger
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the insert fails.
    fn insert_ledger_entry(&self, table: &LedgerTable, entry: &NewLedgerEntry) -> Result<(), DbError>;

    /// All ledger entries in application order
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the table cannot be read.
    fn ledger_entries(&self, table: &LedgerTable) -> Result<Vec<LedgerEntry>, DbError>;

    /// Run `rollback_sql` and stamp `rolled_back_at` on the live entry for
    /// `name`, in one transaction
    ///
    /// Returns the number of entries stamped. Nothing is kept unless both succeed.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the rollback SQL or the ledger update fails.
    fn rollback_and_mark(&self, table: &LedgerTable, name: &str, rollback_sql: &str) -> Result<u64, DbError>;

    /// Version identifiers recorded in an external tool's ledger, ascending
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the table cannot be read.
    fn external_versions(&self, schema: &str, table: &str) -> Result<Vec<String>, DbError>;
}

/// [`Session`] implementation over a `may_postgres::Client`
pub struct PgSession {
    client: Client,
}

impl PgSession {
    /// Create a new session from a `may_postgres::Client`
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Session for PgSession {
    fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        self.client.batch_execute(sql).map_err(DbError::Postgres)
    }

    fn execute_script(&self, sql: &str) -> Result<(), DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_script_span().entered();

        let transaction = Transaction::begin(&self.client)?;
        if let Err(e) = transaction.batch_execute(sql) {
            if let Err(rollback_err) = transaction.rollback() {
                log::warn!("Rollback after failed migration body also failed: {rollback_err}");
            }
            return Err(e);
        }
        transaction.commit()
    }

    fn try_advisory_lock(&self, lock_id: i64, timeout: Duration) -> Result<bool, DbError> {
        let set_timeout = format!("SET statement_timeout = '{}ms'", timeout.as_millis());
        self.client.execute(set_timeout.as_str(), &[])?;

        let result = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_id]);

        // Reset before inspecting the result so the timeout never leaks into migrations.
        let reset = self.client.execute("SET statement_timeout = 0", &[]);

        let acquired: bool = result?.try_get(0)?;
        reset?;
        Ok(acquired)
    }

    fn advisory_unlock(&self, lock_id: i64) -> Result<bool, DbError> {
        let row = self
            .client
            .query_one("SELECT pg_advisory_unlock($1)", &[&lock_id])?;
        Ok(row.try_get(0)?)
    }

    fn advisory_lock_holders(&self, lock_id: i64) -> Result<i64, DbError> {
        // A bigint advisory key is split across classid (high half) and objid (low half).
        let bits = lock_id as u64;
        let high = (bits >> 32) as i64;
        let low = (bits & 0xffff_ffff) as i64;

        let row = self.client.query_one(
            "SELECT COUNT(*) FROM pg_locks \
             WHERE locktype = 'advisory' AND granted \
             AND classid::bigint = $1 AND objid::bigint = $2 AND objsubid = 1",
            &[&high, &low],
        )?;
        Ok(row.try_get(0)?)
    }

    fn table_exists(&self, schema: &str, table: &str) -> Result<bool, DbError> {
        let row = self.client.query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
            &[&schema, &table],
        )?;
        Ok(row.try_get(0)?)
    }

    fn ensure_ledger(&self, table: &LedgerTable) -> Result<(), DbError> {
        self.client.batch_execute(&ledger::ddl(table))?;
        Ok(())
    }

    fn insert_ledger_entry(&self, table: &LedgerTable, entry: &NewLedgerEntry) -> Result<(), DbError> {
        let applied_from = entry.applied_from.as_str();
        self.client.execute(
            ledger::insert_sql(table).as_str(),
            &[
                &entry.name,
                &entry.checksum,
                &entry.execution_time_ms,
                &entry.success,
                &applied_from,
                &entry.tool_version,
                &entry.ci_run_id,
            ],
        )?;
        Ok(())
    }

    fn ledger_entries(&self, table: &LedgerTable) -> Result<Vec<LedgerEntry>, DbError> {
        let rows = self.client.query(ledger::select_sql(table).as_str(), &[])?;
        rows.iter().map(entry_from_row).collect()
    }

    fn rollback_and_mark(&self, table: &LedgerTable, name: &str, rollback_sql: &str) -> Result<u64, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_script_span().entered();

        let transaction = Transaction::begin(&self.client)?;
        transaction.batch_execute(rollback_sql)?;
        let stamped = transaction.execute(ledger::rollback_sql(table).as_str(), &[&name])?;
        transaction.commit()?;
        Ok(stamped)
    }

    fn external_versions(&self, schema: &str, table: &str) -> Result<Vec<String>, DbError> {
        let sql = format!(
            "SELECT version::text FROM {} ORDER BY version",
            ledger::quote_qualified(schema, table)
        );
        let rows = self.client.query(sql.as_str(), &[])?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(DbError::Postgres))
            .collect()
    }
}

/// Build a [`LedgerEntry`] from a row produced by `ledger::select_sql`
fn entry_from_row(row: &Row) -> Result<LedgerEntry, DbError> {
    let applied_from: String = row.try_get(7)?;
    let applied_from = applied_from
        .parse::<AppliedFrom>()
        .map_err(DbError::Parse)?;
    let applied_at: DateTime<Utc> = row.try_get(3)?;
    let rolled_back_at: Option<DateTime<Utc>> = row.try_get(8)?;

    Ok(LedgerEntry {
        id: row.try_get(0)?,
        name: row.try_get(1)?,
        checksum: row.try_get(2)?,
        applied_at,
        applied_by: row.try_get(4)?,
        execution_time_ms: row.try_get(5)?,
        success: row.try_get(6)?,
        applied_from,
        rolled_back_at,
        tool_version: row.try_get(9)?,
        ci_run_id: row.try_get(10)?,
    })
}
