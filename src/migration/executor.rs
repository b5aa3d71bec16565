//! The executor abstraction
//!
//! A [`MigrationExecutor`] applies pending migrations against one environment.
//! Two strategies exist: [`DirectSqlExecutor`] runs the SQL itself and
//! [`DelegatedCliExecutor`] hands the files to the Supabase CLI. Both return
//! an [`ExecutionResult`] from every mutating operation and never let an
//! error escape as a panic or an `Err`.

use crate::config::LockstepConfig;
use crate::connection::{Connector, PgConnector};
use crate::migration::delegated::DelegatedCliExecutor;
use crate::migration::direct::DirectSqlExecutor;
use crate::migration::file::local_migration_names;
use crate::migration::lock::{migration_lock_name, AdvisoryLock};
use crate::migration::record::AppliedFrom;
use crate::migration::tool::{CommandRunner, DiffOutcome, LintOutcome, SystemRunner};
use crate::migration::{ExecutionResult, MigrationError, MigrationStatus};
use crate::reporter::{LogReporter, Reporter};
use crate::session::Session;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variables consulted for a CI run identifier, in order
const CI_RUN_ID_VARS: &[&str] = &["GITHUB_RUN_ID", "CI_PIPELINE_ID"];

/// Who is driving the run; recorded as the ledger's `applied_from`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Cli,
    Ci,
}

impl RunMode {
    #[must_use]
    pub fn applied_from(self) -> AppliedFrom {
        match self {
            RunMode::Cli => AppliedFrom::Cli,
            RunMode::Ci => AppliedFrom::Ci,
        }
    }

    /// Pipeline run identifier from the CI environment, in CI mode only
    #[must_use]
    pub fn ci_run_id(self) -> Option<String> {
        if self == RunMode::Cli {
            return None;
        }
        CI_RUN_ID_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
    }
}

/// Collaborators shared by every executor of one environment
#[derive(Clone)]
pub struct ExecutorContext {
    environment: String,
    config: Arc<LockstepConfig>,
    connector: Arc<dyn Connector>,
    reporter: Arc<dyn Reporter>,
}

impl ExecutorContext {
    /// Context using the PostgreSQL connector and the `log` reporter
    #[must_use]
    pub fn new(config: Arc<LockstepConfig>, environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            config,
            connector: Arc::new(PgConnector),
            reporter: Arc::new(LogReporter),
        }
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    #[must_use]
    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    #[must_use]
    pub fn reporter(&self) -> &dyn Reporter {
        self.reporter.as_ref()
    }

    #[must_use]
    pub fn migrations_dir(&self) -> &Path {
        self.config.migrations_directory()
    }

    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.config.project.name
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.config.migrations.lock_timeout_seconds)
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        self.config.is_production(&self.environment)
    }

    /// # Errors
    ///
    /// Returns `MigrationError::Configuration` when the environment has no URL.
    pub fn database_url(&self) -> Result<String, MigrationError> {
        self.config.database_url(&self.environment).ok_or_else(|| {
            MigrationError::Configuration(format!(
                "No database URL configured for environment '{}'",
                self.environment
            ))
        })
    }

    /// Open a fresh session for this environment
    ///
    /// # Errors
    ///
    /// Returns a configuration error without a URL and a database error when
    /// the connection fails.
    pub fn connect(&self) -> Result<Box<dyn Session>, MigrationError> {
        let url = self.database_url()?;
        Ok(self.connector.open(&url)?)
    }

    /// # Errors
    ///
    /// Returns `MigrationError::Configuration` when the URL or the migrations
    /// directory is missing.
    pub fn validate_environment(&self) -> Result<(), MigrationError> {
        self.database_url()?;
        if !self.migrations_dir().is_dir() {
            return Err(MigrationError::Configuration(format!(
                "Migrations directory not found: {}",
                self.migrations_dir().display()
            )));
        }
        Ok(())
    }

    /// Whether any session holds this project's migration lock right now
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached or queried.
    pub fn lock_status(&self) -> Result<bool, MigrationError> {
        let session = self.connect()?;
        AdvisoryLock::new(session.as_ref(), migration_lock_name(self.project_name())).is_locked()
    }
}

/// Refuse a reset without confirmation or on a production environment
///
/// Runs before anything touches the database or the tool.
///
/// # Errors
///
/// Returns `MigrationError::GuardRejected` when either guard trips.
pub fn check_reset_guards(context: &ExecutorContext, confirm: bool) -> Result<(), MigrationError> {
    if !confirm {
        return Err(MigrationError::GuardRejected(
            "Reset requires explicit confirmation (confirm=true)".to_string(),
        ));
    }
    if context.is_production() {
        return Err(MigrationError::GuardRejected(format!(
            "Cannot reset production database ('{}')",
            context.environment()
        )));
    }
    Ok(())
}

/// A migration strategy
pub trait MigrationExecutor: Send + Sync {
    /// Short name (`sql`, `supabase`)
    fn name(&self) -> &'static str;

    fn context(&self) -> &ExecutorContext;

    /// Apply every pending migration
    fn apply(&self, mode: RunMode) -> ExecutionResult;

    /// Local migrations not applied yet, in execution order
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the applied set cannot be read.
    fn get_pending(&self) -> Result<Vec<String>, MigrationError>;

    /// Applied migrations
    ///
    /// # Errors
    ///
    /// Returns an error if the applied set cannot be read.
    fn get_applied(&self) -> Result<Vec<String>, MigrationError>;

    /// Local migration files in execution order
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the directory cannot be read.
    fn get_local_migrations(&self) -> Result<Vec<String>, MigrationError> {
        local_migration_names(self.context().migrations_dir())
    }

    /// # Errors
    ///
    /// See [`ExecutorContext::validate_environment`].
    fn validate_environment(&self) -> Result<(), MigrationError> {
        self.context().validate_environment()
    }

    /// Summary of local, applied and pending migrations
    ///
    /// # Errors
    ///
    /// Returns an error if any of the listings fails.
    fn status(&self) -> Result<MigrationStatus, MigrationError> {
        Ok(MigrationStatus::new(
            self.name(),
            self.get_local_migrations()?,
            self.get_applied()?,
            self.get_pending()?,
        ))
    }

    /// Undo one applied migration
    fn rollback_migration(&self, migration_name: &str, _rollback_sql: Option<&str>) -> ExecutionResult {
        ExecutionResult::failed(format!(
            "Rollback of {migration_name} is not supported by the {} executor",
            self.name()
        ))
    }

    /// Schema difference between the database and the local migrations
    ///
    /// # Errors
    ///
    /// Returns an error when the strategy cannot produce a diff.
    fn diff(&self, _migration_name: Option<&str>) -> Result<DiffOutcome, MigrationError> {
        Err(MigrationError::Configuration(format!(
            "Schema diff is delegated to the external migration tool; the {} executor does not diff",
            self.name()
        )))
    }

    /// Migrations the next `apply` would run, without running them
    ///
    /// # Errors
    ///
    /// Returns an error if the pending set cannot be determined.
    fn dry_run(&self) -> Result<Vec<String>, MigrationError> {
        self.get_pending()
    }

    /// Write TypeScript types for `schema` to `output`, returning the bytes written
    ///
    /// # Errors
    ///
    /// Returns an error when the strategy has no type generator or generation fails.
    fn gen_types(&self, _schema: &str, _output: &Path) -> Result<usize, MigrationError> {
        Err(MigrationError::Configuration(format!(
            "Type generation needs the Supabase CLI; the {} executor cannot generate types",
            self.name()
        )))
    }

    /// Run the external linter over the database schema
    ///
    /// # Errors
    ///
    /// Returns an error when the strategy has no linter or it cannot run.
    fn lint(&self) -> Result<LintOutcome, MigrationError> {
        Err(MigrationError::Configuration(format!(
            "Linting needs the Supabase CLI; the {} executor cannot lint",
            self.name()
        )))
    }

    /// Drop the database and reapply every migration
    fn reset(&self, confirm: bool) -> ExecutionResult {
        if let Err(e) = check_reset_guards(self.context(), confirm) {
            return ExecutionResult::from_error(&e);
        }
        ExecutionResult::failed(format!("Reset is not supported by the {} executor", self.name()))
    }
}

/// Which strategy a configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Direct,
    Delegated,
}

impl ExecutorKind {
    /// `format = "supabase"` or `use_supabase_cli = true` selects the delegated executor
    #[must_use]
    pub fn from_config(config: &LockstepConfig) -> Self {
        let migrations = &config.migrations;
        if migrations.format.eq_ignore_ascii_case("supabase") || migrations.use_supabase_cli {
            ExecutorKind::Delegated
        } else {
            ExecutorKind::Direct
        }
    }
}

/// Build the executor for `kind`
#[must_use]
pub fn build_executor(
    kind: ExecutorKind,
    context: ExecutorContext,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn MigrationExecutor> {
    match kind {
        ExecutorKind::Direct => Box::new(DirectSqlExecutor::new(context)),
        ExecutorKind::Delegated => Box::new(DelegatedCliExecutor::new(context, runner)),
    }
}

/// Build the executor the configuration asks for, with real processes
#[must_use]
pub fn executor_for(context: ExecutorContext) -> Box<dyn MigrationExecutor> {
    let kind = ExecutorKind::from_config(context.config());
    build_executor(kind, context, Arc::new(SystemRunner))
}
