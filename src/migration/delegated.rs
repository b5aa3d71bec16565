//! Delegated-CLI executor
//!
//! Hands migration application to the Supabase CLI (`supabase db push
//! --db-url`) and reads back what it applied from the CLI's own ledger,
//! `supabase_migrations.schema_migrations`.
//!
//! The CLI records versions, not filenames. A local file counts as applied
//! when its prefix before the first `_` equals a recorded version, so files
//! that do not follow the `{timestamp}_{description}.sql` convention are
//! misreported.

use crate::migration::executor::{check_reset_guards, ExecutorContext, MigrationExecutor, RunMode};
use crate::migration::file::ordinal_prefix;
use crate::migration::lock::migration_lock;
use crate::migration::tool::{
    would_apply_names, CommandRunner, DiffOutcome, LintOutcome, SupabaseCli, SUPABASE_LEDGER_SCHEMA,
    SUPABASE_LEDGER_TABLE,
};
use crate::migration::{ExecutionResult, MigrationError};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

const EXECUTOR_NAME: &str = "supabase";

/// Local filenames whose version prefix appears in `versions`, in filename order
#[must_use]
pub fn reconcile_applied(local: &[String], versions: &[String]) -> Vec<String> {
    let versions: HashSet<&str> = versions.iter().map(String::as_str).collect();
    local
        .iter()
        .filter(|name| versions.contains(ordinal_prefix(name)))
        .cloned()
        .collect()
}

/// Executor that delegates to the Supabase CLI
pub struct DelegatedCliExecutor {
    context: ExecutorContext,
    cli: SupabaseCli,
}

impl DelegatedCliExecutor {
    #[must_use]
    pub fn new(context: ExecutorContext, runner: Arc<dyn CommandRunner>) -> Self {
        let mut cli = SupabaseCli::new(runner);
        if let Some(binary) = &context.config().migrations.supabase_binary {
            cli = cli.with_binary(binary.clone());
        }
        Self { context, cli }
    }

    #[must_use]
    pub fn cli(&self) -> &SupabaseCli {
        &self.cli
    }

    /// Versions recorded by the CLI; empty before its first run
    fn external_versions(&self) -> Result<Vec<String>, MigrationError> {
        let session = self.context.connect()?;
        if !session.table_exists(SUPABASE_LEDGER_SCHEMA, SUPABASE_LEDGER_TABLE)? {
            return Ok(Vec::new());
        }
        Ok(session.external_versions(SUPABASE_LEDGER_SCHEMA, SUPABASE_LEDGER_TABLE)?)
    }

    fn apply_inner(&self, result: &mut ExecutionResult) -> Result<(), MigrationError> {
        let reporter = self.context.reporter();

        self.cli.ensure_available()?;
        let url = self.context.database_url()?;
        let migrations_dir = self.context.migrations_dir();
        if !migrations_dir.is_dir() {
            return Err(MigrationError::Configuration(format!(
                "Migrations directory not found: {}",
                migrations_dir.display()
            )));
        }

        // The CLI has no cross-process exclusion of its own; hold ours while it runs.
        let session = self.context.connect()?;
        let guard = migration_lock(session.as_ref(), self.context.project_name(), self.context.lock_timeout())?;

        reporter.progress("Using Supabase CLI for migrations...");
        let pushed = self.cli.push(&url, migrations_dir, false);
        let released = guard.release();

        let outcome = match (pushed, released) {
            (Err(e), Err(release_err)) => {
                log::warn!("{release_err}");
                return Err(e);
            }
            (Err(e), Ok(())) => return Err(e),
            (Ok(outcome), Err(release_err)) => {
                result.add_applied(outcome.count);
                return Err(release_err);
            }
            (Ok(outcome), Ok(())) => outcome,
        };

        result.add_applied(outcome.count);
        result.set_detail("message", outcome.message.clone());
        if outcome.count > 0 {
            reporter.success(&format!("Applied {} migration(s)", outcome.count));
        } else {
            reporter.success("No pending migrations.");
        }
        Ok(())
    }
}

impl MigrationExecutor for DelegatedCliExecutor {
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
        result.set_detail("applied_from", mode.applied_from().as_str());

        if let Err(e) = self.apply_inner(&mut result) {
            self.context.reporter().failure(&format!("Migration failed: {e}"));
            result.fail(&e);
        }
        result
    }

    fn get_pending(&self) -> Result<Vec<String>, MigrationError> {
        let local = self.get_local_migrations()?;
        if local.is_empty() {
            return Ok(local);
        }
        let applied: HashSet<String> = reconcile_applied(&local, &self.external_versions()?)
            .into_iter()
            .collect();
        Ok(local.into_iter().filter(|name| !applied.contains(name)).collect())
    }

    fn get_applied(&self) -> Result<Vec<String>, MigrationError> {
        let local = self.get_local_migrations()?;
        Ok(reconcile_applied(&local, &self.external_versions()?))
    }

    fn diff(&self, migration_name: Option<&str>) -> Result<DiffOutcome, MigrationError> {
        self.cli.ensure_available()?;
        let url = self.context.database_url()?;
        self.cli.diff(&url, self.context.migrations_dir(), migration_name)
    }

    /// Asks the CLI itself; names come from parsing its output
    fn dry_run(&self) -> Result<Vec<String>, MigrationError> {
        self.cli.ensure_available()?;
        let url = self.context.database_url()?;
        let outcome = self.cli.push(&url, self.context.migrations_dir(), true)?;
        log::info!("{}", outcome.message);
        Ok(would_apply_names(&outcome.output))
    }

    fn gen_types(&self, schema: &str, output: &Path) -> Result<usize, MigrationError> {
        self.cli.ensure_available()?;
        let url = self.context.database_url()?;
        self.cli.gen_types(&url, schema, output)
    }

    fn lint(&self) -> Result<LintOutcome, MigrationError> {
        self.cli.ensure_available()?;
        let url = self.context.database_url()?;
        self.cli.lint(&url, self.context.migrations_dir())
    }

    fn reset(&self, confirm: bool) -> ExecutionResult {
        let mut result = ExecutionResult::ok();
        result.set_detail("executor", EXECUTOR_NAME);

        let outcome = check_reset_guards(&self.context, confirm)
            .and_then(|()| self.cli.ensure_available())
            .and_then(|()| self.context.database_url())
            .and_then(|url| self.cli.reset(&url, self.context.migrations_dir()));

        match outcome {
            Ok(()) => self.context.reporter().success("Database reset"),
            Err(e) => {
                self.context.reporter().failure(&e.to_string());
                result.fail(&e);
            }
        }
        result
    }
}
