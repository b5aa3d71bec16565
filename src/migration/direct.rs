//! Direct SQL executor
//!
//! Runs each pending migration file as one transaction on its own session,
//! under the project's advisory lock, and records every attempt in the
//! ledger. Stops at the first failure.

use crate::config::DriftPolicy;
use crate::migration::checksum::{compute_checksum, validate_checksum};
use crate::migration::executor::{ExecutorContext, MigrationExecutor, RunMode};
use crate::migration::file::down_file_path;
use crate::migration::ledger::{Drift, Ledger};
use crate::migration::lock::{migration_lock, LockGuard};
use crate::migration::record::NewLedgerEntry;
use crate::migration::{ExecutionResult, MigrationError, MigrationStatus};
use crate::session::Session;
use serde_json::{json, Value};
use std::fs;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

const EXECUTOR_NAME: &str = "sql";

/// Executor that applies SQL files itself
pub struct DirectSqlExecutor {
    context: ExecutorContext,
}

impl DirectSqlExecutor {
    #[must_use]
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }

    /// Ledger for the configured tracking table
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Configuration` for invalid tracking identifiers.
    pub fn ledger(&self) -> Result<Ledger, MigrationError> {
        Ledger::from_config(self.context.config())
    }

    /// Applied migrations whose files changed since they were applied
    ///
    /// # Errors
    ///
    /// Returns an error if the database or the files cannot be read.
    pub fn detect_drift(&self) -> Result<Vec<Drift>, MigrationError> {
        let session = self.context.connect()?;
        self.ledger()?.detect_drift(session.as_ref())
    }

    /// Whether any session holds the project's migration lock
    ///
    /// # Errors
    ///
    /// See [`ExecutorContext::lock_status`].
    pub fn lock_status(&self) -> Result<bool, MigrationError> {
        self.context.lock_status()
    }

    fn take_lock<'s>(&self, session: &'s dyn Session) -> Result<LockGuard<'s>, MigrationError> {
        let guard = migration_lock(session, self.context.project_name(), self.context.lock_timeout())?;
        self.context
            .reporter()
            .progress(&format!("Acquired migration lock for {}", self.context.project_name()));
        Ok(guard)
    }

    fn apply_inner(&self, mode: RunMode, result: &mut ExecutionResult) -> Result<(), MigrationError> {
        let reporter = self.context.reporter();
        let ledger = self.ledger()?;

        // Without local files nothing can be pending, whatever the database says.
        if ledger.local_migrations()?.is_empty() {
            reporter.success("No pending migrations.");
            return Ok(());
        }

        let session = self.context.connect()?;
        let session = session.as_ref();

        if ledger.get_pending_migrations(session)?.is_empty() {
            reporter.success("No pending migrations.");
            return Ok(());
        }

        self.check_drift(&ledger, session, result)?;

        let guard = self.take_lock(session)?;
        let outcome = self.apply_locked(&ledger, session, mode, result);
        let released = guard.release();

        match (outcome, released) {
            (Err(e), Err(release_err)) => {
                log::warn!("{release_err}");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn check_drift(
        &self,
        ledger: &Ledger,
        session: &dyn Session,
        result: &mut ExecutionResult,
    ) -> Result<(), MigrationError> {
        let drift = ledger.detect_drift(session)?;
        if drift.is_empty() {
            return Ok(());
        }

        let listed: Vec<Value> = drift
            .iter()
            .map(|d| json!({ "name": d.name, "recorded": d.recorded, "current": d.current }))
            .collect();
        result.set_detail("drift", listed);

        match self.context.config().migrations.drift_policy {
            DriftPolicy::Warn => {
                for d in &drift {
                    self.context.reporter().warning(&format!(
                        "{} was modified after being applied (recorded {}, now {})",
                        d.name, d.recorded, d.current
                    ));
                }
                Ok(())
            }
            DriftPolicy::Block => drift
                .iter()
                .try_for_each(|d| validate_checksum(&d.name, &d.recorded, &d.current)),
        }
    }

    fn apply_locked(
        &self,
        ledger: &Ledger,
        session: &dyn Session,
        mode: RunMode,
        result: &mut ExecutionResult,
    ) -> Result<(), MigrationError> {
        let reporter = self.context.reporter();
        ledger.ensure_tracking_table(session)?;

        // Whoever held the lock before us may have applied some of these.
        let pending = ledger.get_pending_migrations(session)?;
        if pending.is_empty() {
            reporter.success("No pending migrations.");
            return Ok(());
        }

        let applied_from = mode.applied_from();
        let ci_run_id = mode.ci_run_id();
        let mut applied_files: Vec<String> = Vec::new();

        for name in pending {
            let path = ledger.migrations_dir().join(&name);
            if !path.is_file() {
                reporter.warning(&format!("Skipping {name}: file not found"));
                result.record_skipped();
                continue;
            }

            let checksum = compute_checksum(&path)?;
            let sql = fs::read_to_string(&path).map_err(|e| MigrationError::io(&path, e))?;

            reporter.progress(&format!("Applying: {name}..."));
            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::apply_migration_span(&name).entered();

            let start = Instant::now();
            let executed = session.execute_script(&sql);
            let elapsed = start.elapsed();
            let elapsed_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);

            let entry = NewLedgerEntry::new(&name, checksum, elapsed_ms, executed.is_ok(), applied_from)
                .with_ci_run_id(ci_run_id.clone());

            if let Err(e) = executed {
                let message = e.to_string();
                if let Err(record_err) = ledger.record_migration(session, &entry) {
                    log::warn!("Could not record failed attempt of {name}: {record_err}");
                }
                #[cfg(feature = "metrics")]
                crate::metrics::METRICS.record_failed(EXECUTOR_NAME);
                reporter.failure(&format!("  Failed: {message}"));
                result.set_detail("applied_files", applied_files);
                return Err(MigrationError::Execution { name, message });
            }

            // Committed: count it even if the bookkeeping below fails.
            result.record_applied();
            #[cfg(feature = "metrics")]
            crate::metrics::METRICS.record_applied(EXECUTOR_NAME, elapsed);

            if let Err(e) = ledger.record_migration(session, &entry) {
                result.set_detail("applied_files", applied_files);
                return Err(MigrationError::Execution {
                    name,
                    message: format!("applied but could not be recorded in the ledger: {e}"),
                });
            }

            reporter.success(&format!("  Applied in {elapsed_ms}ms"));
            applied_files.push(name);
        }

        result.set_detail("applied_files", applied_files);
        Ok(())
    }

    fn rollback_inner(
        &self,
        migration_name: &str,
        rollback_sql: Option<&str>,
        result: &mut ExecutionResult,
    ) -> Result<(), MigrationError> {
        self.context.database_url()?;
        let ledger = self.ledger()?;

        let sql = match rollback_sql {
            Some(sql) => sql.to_string(),
            None => {
                let down = down_file_path(ledger.migrations_dir(), migration_name);
                if !down.is_file() {
                    return Err(MigrationError::Configuration(format!(
                        "No rollback SQL found for {migration_name}: create {} or pass the SQL explicitly",
                        down.display()
                    )));
                }
                fs::read_to_string(&down).map_err(|e| MigrationError::io(&down, e))?
            }
        };

        let session = self.context.connect()?;
        let session = session.as_ref();

        let guard = self.take_lock(session)?;
        let outcome = self.rollback_locked(&ledger, session, migration_name, &sql, result);
        let released = guard.release();

        match (outcome, released) {
            (Err(e), Err(release_err)) => {
                log::warn!("{release_err}");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn rollback_locked(
        &self,
        ledger: &Ledger,
        session: &dyn Session,
        migration_name: &str,
        sql: &str,
        result: &mut ExecutionResult,
    ) -> Result<(), MigrationError> {
        let reporter = self.context.reporter();

        if !ledger
            .get_applied_migrations(session)?
            .iter()
            .any(|name| name == migration_name)
        {
            reporter.warning(&format!("{migration_name} is not recorded as applied; running rollback SQL anyway"));
        }

        ledger.ensure_tracking_table(session)?;
        let stamped = ledger
            .rollback_migration(session, migration_name, sql)
            .map_err(|e| MigrationError::Execution {
                name: migration_name.to_string(),
                message: format!("rollback failed: {e}"),
            })?;
        result.record_applied();
        result.set_detail("ledger_entries_marked", stamped);
        reporter.success(&format!("Rolled back: {migration_name}"));
        Ok(())
    }
}

impl MigrationExecutor for DirectSqlExecutor {
    fn name(&self) -> &'static str {
        EXECUTOR_NAME
    }

    fn context(&self) -> &ExecutorContext {
        &self.context
    }

    fn apply(&self, mode: RunMode) -> ExecutionResult {
        let mut result = ExecutionResult::ok();
        result.set_detail("executor", EXECUTOR_NAME);
        result.set_detail("run_id", uuid::Uuid::new_v4().to_string());

        if let Err(e) = self.apply_inner(mode, &mut result) {
            if !matches!(e, MigrationError::Execution { .. }) {
                self.context.reporter().failure(&e.to_string());
            }
            result.fail(&e);
        }
        result
    }

    fn get_pending(&self) -> Result<Vec<String>, MigrationError> {
        let ledger = self.ledger()?;
        if ledger.local_migrations()?.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.context.connect()?;
        ledger.get_pending_migrations(session.as_ref())
    }

    fn get_applied(&self) -> Result<Vec<String>, MigrationError> {
        let session = self.context.connect()?;
        self.ledger()?.get_applied_migrations(session.as_ref())
    }

    fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let ledger = self.ledger()?;
        let session = self.context.connect()?;
        let session = session.as_ref();

        let local = ledger.local_migrations()?;
        let applied = ledger.get_applied_migrations(session)?;
        let pending = ledger.get_pending_migrations(session)?;
        Ok(MigrationStatus::new(EXECUTOR_NAME, local, applied, pending)
            .with_drift(ledger.detect_drift(session)?)
            .with_missing(ledger.missing_files(session)?))
    }

    fn rollback_migration(&self, migration_name: &str, rollback_sql: Option<&str>) -> ExecutionResult {
        let mut result = ExecutionResult::ok();
        result.set_detail("executor", EXECUTOR_NAME);
        result.set_detail("migration", migration_name);

        if let Err(e) = self.rollback_inner(migration_name, rollback_sql, &mut result) {
            self.context.reporter().failure(&e.to_string());
            result.fail(&e);
        }
        result
    }
}
