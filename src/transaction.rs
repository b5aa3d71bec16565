//! Transaction guard used to apply one migration body atomically.
//!
//! A [`Transaction`] issues `BEGIN` on creation. It must be closed with
//! [`Transaction::commit`] or [`Transaction::rollback`]; dropping an open
//! transaction rolls it back, so an early `?` return never leaves a half
//! applied migration behind.

use crate::session::DbError;
use may_postgres::types::ToSql;
use may_postgres::Client;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// A database transaction borrowed from a session's client
pub struct Transaction<'a> {
    client: &'a Client,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Start a transaction on `client`
    ///
    /// # Errors
    ///
    /// Returns `DbError` if `BEGIN` fails.
    pub fn begin(client: &'a Client) -> Result<Self, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        client.batch_execute("BEGIN")?;
        Ok(Self {
            client,
            closed: false,
        })
    }

    /// Execute statements inside the transaction
    ///
    /// # Errors
    ///
    /// Returns `DbError::Other` if the transaction is already closed, or the
    /// statement's error.
    pub fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::Other(
                "Transaction has already been committed or rolled back".to_string(),
            ));
        }
        self.client.batch_execute(sql)?;
        Ok(())
    }

    /// Execute one parameterized statement inside the transaction
    ///
    /// Returns the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Other` if the transaction is already closed, or the
    /// statement's error.
    pub fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, DbError> {
        if self.closed {
            return Err(DbError::Other(
                "Transaction has already been committed or rolled back".to_string(),
            ));
        }
        Ok(self.client.execute(sql, params)?)
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns `DbError` if `COMMIT` fails. PostgreSQL discards the
    /// transaction in that case.
    pub fn commit(mut self) -> Result<(), DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        self.closed = true;
        self.client.batch_execute("COMMIT")?;
        Ok(())
    }

    /// Roll the transaction back
    ///
    /// # Errors
    ///
    /// Returns `DbError` if `ROLLBACK` fails.
    pub fn rollback(mut self) -> Result<(), DbError> {
        self.closed = true;
        self.client.batch_execute("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            // Nothing to propagate to from drop; a broken connection discards the transaction anyway.
            if let Err(e) = self.client.batch_execute("ROLLBACK") {
                log::warn!("Failed to roll back transaction: {e}");
            }
        }
    }
}
