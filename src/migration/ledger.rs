//! Migration ledger: the tracking table recording every migration attempt
//!
//! The ledger is append-only. Every attempt, successful or not, adds a row;
//! a rollback stamps `rolled_back_at` on the live row instead of deleting it.
//! A migration is *applied* while it has a successful row that has not been
//! rolled back, and a partial unique index keeps that row unique per name.

use crate::config::LockstepConfig;
use crate::migration::checksum::compute_checksum;
use crate::migration::file::local_migration_names;
use crate::migration::record::{LedgerEntry, NewLedgerEntry};
use crate::migration::MigrationError;
use crate::session::Session;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap_or_else(|e| panic!("invalid identifier regex: {e}"))
});

/// Schema-qualified name of the ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTable {
    schema: String,
    table: String,
}

impl LedgerTable {
    /// # Errors
    ///
    /// Returns `MigrationError::Configuration` if either part is not a plain
    /// SQL identifier.
    pub fn new(schema: &str, table: &str) -> Result<Self, MigrationError> {
        for (what, ident) in [("tracking_schema", schema), ("tracking_table", table)] {
            if !IDENTIFIER.is_match(ident) {
                return Err(MigrationError::Configuration(format!(
                    "Invalid {what} '{ident}': use letters, digits and underscores only"
                )));
            }
        }
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// `"schema"."table"`
    #[must_use]
    pub fn qualified(&self) -> String {
        quote_qualified(&self.schema, &self.table)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a schema-qualified table name for interpolation into SQL
#[must_use]
pub fn quote_qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// DDL creating the ledger table and its indexes, idempotently
///
/// Uses `IF NOT EXISTS` throughout so two first-time runners cannot race on
/// an existence check.
#[must_use]
pub fn ddl(table: &LedgerTable) -> String {
    let qualified = table.qualified();
    let applied_at_index = quote_ident(&format!("ix_{}_applied_at", table.table()));
    let live_index = quote_ident(&format!("ux_{}_live_name", table.table()));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {qualified} (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            checksum VARCHAR(64) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            applied_by VARCHAR(255) DEFAULT CURRENT_USER,
            execution_time_ms BIGINT NOT NULL DEFAULT 0,
            success BOOLEAN NOT NULL DEFAULT TRUE,
            applied_from VARCHAR(64) NOT NULL DEFAULT 'cli',
            rolled_back_at TIMESTAMPTZ,
            tool_version VARCHAR(32),
            ci_run_id VARCHAR(128)
        );

        CREATE INDEX IF NOT EXISTS {applied_at_index}
            ON {qualified} (applied_at);

        CREATE UNIQUE INDEX IF NOT EXISTS {live_index}
            ON {qualified} (name)
            WHERE success AND rolled_back_at IS NULL;
        "#
    )
}

/// Parameterized insert: name, checksum, execution_time_ms, success, applied_from, tool_version, ci_run_id
#[must_use]
pub fn insert_sql(table: &LedgerTable) -> String {
    format!(
        "INSERT INTO {} (name, checksum, execution_time_ms, success, applied_from, tool_version, ci_run_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        table.qualified()
    )
}

/// All entries, oldest attempt first
#[must_use]
pub fn select_sql(table: &LedgerTable) -> String {
    format!(
        "SELECT id, name, checksum, applied_at, applied_by, execution_time_ms, success, \
         applied_from, rolled_back_at, tool_version, ci_run_id \
         FROM {} ORDER BY applied_at ASC, id ASC",
        table.qualified()
    )
}

/// Stamp the live entry for `$1` as rolled back
#[must_use]
pub fn rollback_sql(table: &LedgerTable) -> String {
    format!(
        "UPDATE {} SET rolled_back_at = CURRENT_TIMESTAMP \
         WHERE name = $1 AND success AND rolled_back_at IS NULL",
        table.qualified()
    )
}

/// An applied migration whose file content changed since it was applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub name: String,
    pub recorded: String,
    pub current: String,
}

/// Ledger bookkeeping for one migrations directory
#[derive(Debug, Clone)]
pub struct Ledger {
    table: LedgerTable,
    migrations_dir: PathBuf,
}

impl Ledger {
    #[must_use]
    pub fn new(table: LedgerTable, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            table,
            migrations_dir: migrations_dir.into(),
        }
    }

    /// # Errors
    ///
    /// Returns `MigrationError::Configuration` for invalid tracking identifiers.
    pub fn from_config(config: &LockstepConfig) -> Result<Self, MigrationError> {
        let table = LedgerTable::new(
            &config.migrations.tracking_schema,
            &config.migrations.tracking_table,
        )?;
        Ok(Self::new(table, config.migrations_directory()))
    }

    #[must_use]
    pub fn table(&self) -> &LedgerTable {
        &self.table
    }

    #[must_use]
    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Create the tracking table if it does not exist
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the DDL fails.
    pub fn ensure_tracking_table(&self, session: &dyn Session) -> Result<(), MigrationError> {
        session.ensure_ledger(&self.table)?;
        Ok(())
    }

    /// Content hash of a migration file
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the file cannot be read.
    pub fn compute_checksum(file_path: &Path) -> Result<String, MigrationError> {
        compute_checksum(file_path)
    }

    /// Local migration filenames in execution order
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the directory cannot be read.
    pub fn local_migrations(&self) -> Result<Vec<String>, MigrationError> {
        local_migration_names(&self.migrations_dir)
    }

    /// Every ledger entry, oldest first; empty when the table does not exist yet
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the table cannot be read.
    pub fn entries(&self, session: &dyn Session) -> Result<Vec<LedgerEntry>, MigrationError> {
        if !session.table_exists(self.table.schema(), self.table.table())? {
            return Ok(Vec::new());
        }
        Ok(session.ledger_entries(&self.table)?)
    }

    /// Names of applied migrations, in application order
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the ledger cannot be read.
    pub fn get_applied_migrations(&self, session: &dyn Session) -> Result<Vec<String>, MigrationError> {
        Ok(self
            .entries(session)?
            .into_iter()
            .filter(LedgerEntry::is_live)
            .map(|entry| entry.name)
            .collect())
    }

    /// Local migrations without a live successful entry, in filename order
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the ledger cannot be read.
    pub fn get_pending_migrations(&self, session: &dyn Session) -> Result<Vec<String>, MigrationError> {
        let applied: HashSet<String> = self.get_applied_migrations(session)?.into_iter().collect();
        Ok(self
            .local_migrations()?
            .into_iter()
            .filter(|name| !applied.contains(name))
            .collect())
    }

    /// Append an attempt to the ledger
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the insert fails.
    pub fn record_migration(&self, session: &dyn Session, entry: &NewLedgerEntry) -> Result<(), MigrationError> {
        session.insert_ledger_entry(&self.table, entry)?;
        Ok(())
    }

    /// Run `rollback_sql` and stamp the live entry for `name` as rolled back
    ///
    /// Both happen in one transaction. Returns the number of entries stamped
    /// (0 when nothing was applied).
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if either step fails; neither is kept.
    pub fn rollback_migration(
        &self,
        session: &dyn Session,
        name: &str,
        rollback_sql: &str,
    ) -> Result<u64, MigrationError> {
        Ok(session.rollback_and_mark(&self.table, name, rollback_sql)?)
    }

    /// Applied migrations whose file now hashes differently than recorded
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or a file cannot be read.
    pub fn detect_drift(&self, session: &dyn Session) -> Result<Vec<Drift>, MigrationError> {
        let mut drift = Vec::new();
        for entry in self.entries(session)?.into_iter().filter(LedgerEntry::is_live) {
            let path = self.migrations_dir.join(&entry.name);
            if !path.is_file() {
                continue;
            }
            let current = compute_checksum(&path)?;
            if current != entry.checksum {
                drift.push(Drift {
                    name: entry.name,
                    recorded: entry.checksum,
                    current,
                });
            }
        }
        Ok(drift)
    }

    /// Applied migrations with no file left on disk
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the ledger cannot be read.
    pub fn missing_files(&self, session: &dyn Session) -> Result<Vec<String>, MigrationError> {
        Ok(self
            .get_applied_migrations(session)?
            .into_iter()
            .filter(|name| !self.migrations_dir.join(name).is_file())
            .collect())
    }
}
