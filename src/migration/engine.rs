//! Migration engine: executor selection and the operations front-ends call

use crate::config::LockstepConfig;
use crate::migration::executor::{
    build_executor, ExecutorContext, ExecutorKind, MigrationExecutor, RunMode,
};
use crate::migration::tool::{CommandRunner, DiffOutcome, LintOutcome, SystemRunner};
use crate::migration::{ExecutionResult, MigrationError, MigrationStatus};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Statements that deserve a second look before they run
const DANGEROUS_KEYWORDS: &[&str] = &["DROP TABLE", "TRUNCATE", "DELETE FROM"];

/// Runs migrations for one environment through the configured executor
///
/// The executor is built on first use and cached; [`MigrationEngine::set_executor`]
/// replaces it.
pub struct MigrationEngine {
    context: ExecutorContext,
    runner: Arc<dyn CommandRunner>,
    executor: Option<Box<dyn MigrationExecutor>>,
}

impl MigrationEngine {
    #[must_use]
    pub fn new(config: Arc<LockstepConfig>, environment: impl Into<String>) -> Self {
        Self::from_context(ExecutorContext::new(config, environment))
    }

    #[must_use]
    pub fn from_context(context: ExecutorContext) -> Self {
        Self {
            context,
            runner: Arc::new(SystemRunner),
            executor: None,
        }
    }

    /// Use `runner` for the delegated executor's subprocesses
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self.executor = None;
        self
    }

    #[must_use]
    pub fn context(&self) -> &ExecutorContext {
        &self.context
    }

    /// Force a specific executor
    pub fn set_executor(&mut self, executor: Box<dyn MigrationExecutor>) {
        self.executor = Some(executor);
    }

    /// The active executor, built from configuration on first use
    pub fn executor(&mut self) -> &dyn MigrationExecutor {
        let executor = self.executor.get_or_insert_with(|| {
            let kind = ExecutorKind::from_config(self.context.config());
            if kind == ExecutorKind::Delegated {
                self.context.reporter().progress("Using Supabase CLI executor");
            }
            build_executor(kind, self.context.clone(), Arc::clone(&self.runner))
        });
        executor.as_ref()
    }

    /// # Errors
    ///
    /// See [`MigrationExecutor::get_pending`].
    pub fn pending_migrations(&mut self) -> Result<Vec<String>, MigrationError> {
        self.executor().get_pending()
    }

    /// # Errors
    ///
    /// See [`MigrationExecutor::get_applied`].
    pub fn applied_migrations(&mut self) -> Result<Vec<String>, MigrationError> {
        self.executor().get_applied()
    }

    pub fn apply_migrations(&mut self, mode: RunMode) -> ExecutionResult {
        self.executor().apply(mode)
    }

    /// # Errors
    ///
    /// See [`MigrationExecutor::status`].
    pub fn status(&mut self) -> Result<MigrationStatus, MigrationError> {
        self.executor().status()
    }

    pub fn rollback(&mut self, migration_name: &str, rollback_sql: Option<&str>) -> ExecutionResult {
        self.executor().rollback_migration(migration_name, rollback_sql)
    }

    /// # Errors
    ///
    /// See [`MigrationExecutor::diff`].
    pub fn diff(&mut self, migration_name: Option<&str>) -> Result<DiffOutcome, MigrationError> {
        self.executor().diff(migration_name)
    }

    pub fn reset(&mut self, confirm: bool) -> ExecutionResult {
        self.executor().reset(confirm)
    }

    /// # Errors
    ///
    /// See [`MigrationExecutor::dry_run`].
    pub fn dry_run(&mut self) -> Result<Vec<String>, MigrationError> {
        self.executor().dry_run()
    }

    /// # Errors
    ///
    /// See [`MigrationExecutor::gen_types`].
    pub fn gen_types(&mut self, schema: &str, output: &Path) -> Result<usize, MigrationError> {
        self.executor().gen_types(schema, output)
    }

    /// # Errors
    ///
    /// See [`MigrationExecutor::lint`].
    pub fn lint(&mut self) -> Result<LintOutcome, MigrationError> {
        self.executor().lint()
    }

    /// # Errors
    ///
    /// See [`ExecutorContext::validate_environment`].
    pub fn validate_environment(&mut self) -> Result<(), MigrationError> {
        self.executor().validate_environment()
    }

    /// # Errors
    ///
    /// See [`ExecutorContext::lock_status`].
    pub fn lock_status(&self) -> Result<bool, MigrationError> {
        self.context.lock_status()
    }
}

/// Pre-flight checks on one migration file
///
/// Returns problems and warnings as operator-facing lines; an empty list means
/// nothing stood out.
#[must_use]
pub fn validate_migration(path: &Path) -> Vec<String> {
    let mut problems = Vec::new();

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            problems.push(format!("File not found: {}", path.display()));
            return problems;
        }
        Err(e) => {
            problems.push(format!("Cannot read {}: {e}", path.display()));
            return problems;
        }
    };

    if content.trim().is_empty() {
        problems.push("Migration file is empty".to_string());
    }

    let upper = content.to_uppercase();
    for keyword in DANGEROUS_KEYWORDS {
        if upper.contains(keyword) {
            problems.push(format!(
                "Warning: Migration contains '{keyword}' (ensure this is intentional)"
            ));
        }
    }

    problems
}
