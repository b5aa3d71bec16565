//! End-to-end migration runs against the in-memory database
//!
//! These exercise whole `apply`/`rollback`/`reset` calls through the public
//! API, including several executors racing for the same lock.

use lockstep::config::{DriftPolicy, LockstepConfig};
use lockstep::migration::{
    compute_checksum, AdvisoryLock, DelegatedCliExecutor, DirectSqlExecutor, ExecutorContext,
    MigrationEngine, MigrationExecutor, RunMode,
};
use lockstep::migration::lock::migration_lock_name;
use lockstep::migration::tool::CommandOutput;
use lockstep::testing::{MemoryDatabase, RecordingReporter, ScriptedRunner};
use lockstep::Connector;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const SCHEMA: &str = "public";
const TABLE: &str = "schema_migrations";

struct Project {
    dir: tempfile::TempDir,
    db: MemoryDatabase,
    config: LockstepConfig,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = LockstepConfig::new("shop", dir.path())
            .with_environment_url("local", "postgres://localhost/shop")
            .with_environment_url("production", "postgres://prod/shop");
        Self {
            dir,
            db: MemoryDatabase::new(),
            config,
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, name: &str, sql: &str) {
        fs::write(self.path().join(name), sql).unwrap();
    }

    fn context(&self, environment: &str) -> ExecutorContext {
        ExecutorContext::new(Arc::new(self.config.clone()), environment)
            .with_connector(Arc::new(self.db.clone()))
            .with_reporter(Arc::new(RecordingReporter::new()))
    }

    fn direct(&self) -> DirectSqlExecutor {
        DirectSqlExecutor::new(self.context("local"))
    }

    fn live_names(&self) -> Vec<String> {
        self.db
            .ledger_entries(SCHEMA, TABLE)
            .into_iter()
            .filter(|e| e.is_live())
            .map(|e| e.name)
            .collect()
    }
}

#[test]
fn test_two_file_scenario() {
    let project = Project::new();
    project.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");
    project.write("20240102000000_b.sql", "CREATE TABLE b (id INT);");

    let result = project.direct().apply(RunMode::Cli);
    assert!(result.success(), "{:?}", result.error());
    assert_eq!(result.applied(), 2);

    assert_eq!(
        project.db.executed_scripts(),
        vec!["CREATE TABLE a (id INT);", "CREATE TABLE b (id INT);"]
    );
    assert_eq!(project.live_names(), vec!["20240101000000_a.sql", "20240102000000_b.sql"]);
    assert_eq!(project.db.held_locks(), 0);
}

#[test]
fn test_second_apply_is_a_no_op() {
    let project = Project::new();
    project.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");

    assert_eq!(project.direct().apply(RunMode::Cli).applied(), 1);

    let again = project.direct().apply(RunMode::Ci);
    assert!(again.success());
    assert_eq!(again.applied(), 0);
    assert_eq!(project.db.executed_scripts().len(), 1);
    assert_eq!(project.db.ledger_entries(SCHEMA, TABLE).len(), 1);
}

#[test]
fn test_files_apply_in_filename_order() {
    let project = Project::new();
    // Written out of order on purpose
    project.write("20240301000000_c.sql", "-- c");
    project.write("20240101000000_a.sql", "-- a");
    project.write("20240201000000_b.sql", "-- b");

    assert!(project.direct().apply(RunMode::Cli).success());
    assert_eq!(project.db.executed_scripts(), vec!["-- a", "-- b", "-- c"]);

    let applied = project.direct().get_applied().unwrap();
    assert_eq!(
        applied,
        vec!["20240101000000_a.sql", "20240201000000_b.sql", "20240301000000_c.sql"]
    );
}

#[test]
fn test_failure_stops_the_run_and_is_retryable() {
    let project = Project::new();
    project.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");
    project.write("20240102000000_b.sql", "CREATE TABLE b (broken);");
    project.write("20240103000000_c.sql", "CREATE TABLE c (id INT);");
    project.db.fail_scripts_containing("broken");

    let result = project.direct().apply(RunMode::Cli);
    assert!(!result.success());
    assert_eq!(result.applied(), 1);
    assert_eq!(result.error_kind(), Some("execution"));
    assert!(result.error().unwrap().contains("20240102000000_b.sql"));

    // c never ran
    assert_eq!(project.db.executed_scripts(), vec!["CREATE TABLE a (id INT);"]);
    let entries = project.db.ledger_entries(SCHEMA, TABLE);
    assert_eq!(entries.len(), 2);
    assert!(entries[0].success);
    assert!(!entries[1].success);
    assert_eq!(project.db.held_locks(), 0);

    // Fix the file and retry: the failed attempt stays in the ledger
    project.write("20240102000000_b.sql", "CREATE TABLE b (id INT);");
    let retry = project.direct().apply(RunMode::Cli);
    assert!(retry.success(), "{:?}", retry.error());
    assert_eq!(retry.applied(), 2);
    assert_eq!(project.db.ledger_entries(SCHEMA, TABLE).len(), 4);
    assert_eq!(project.live_names().len(), 3);
}

#[test]
fn test_apply_refuses_while_lock_is_held_elsewhere() {
    let project = Project::new();
    project.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");

    let other = project.db.open("postgres://localhost/shop").unwrap();
    let mut held = AdvisoryLock::new(other.as_ref(), migration_lock_name("shop"));
    assert!(held.acquire(Duration::from_secs(1)).unwrap());

    let result = project.direct().apply(RunMode::Cli);
    assert!(!result.success());
    assert_eq!(result.error_kind(), Some("lock_unavailable"));
    assert!(result.error().unwrap().contains("Could not acquire migration lock"));
    assert!(project.db.executed_scripts().is_empty());

    held.release().unwrap();
    assert!(project.direct().apply(RunMode::Cli).success());
}

#[test]
fn test_lock_is_freed_when_holder_goes_away() {
    let project = Project::new();
    project.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");

    {
        let crashed = project.db.open("postgres://localhost/shop").unwrap();
        let mut lock = AdvisoryLock::new(crashed.as_ref(), migration_lock_name("shop"));
        assert!(lock.acquire(Duration::from_secs(1)).unwrap());
        assert!(project.direct().lock_status().unwrap());
        // Session goes away without an unlock call
    }

    assert!(!project.direct().lock_status().unwrap());
    assert!(project.direct().apply(RunMode::Cli).success());
}

#[test]
fn test_concurrent_applies_run_each_migration_once() {
    let project = Project::new();
    for i in 1..=4 {
        project.write(&format!("2024010{i}000000_m{i}.sql"), &format!("-- migration {i}"));
    }
    project.db.set_script_delay(Duration::from_millis(20));

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let executor = project.direct();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                executor.apply(RunMode::Ci)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Losers either saw the lock taken or found nothing left to do
    for result in &results {
        if !result.success() {
            assert_eq!(result.error_kind(), Some("lock_unavailable"));
            assert_eq!(result.applied(), 0);
        }
    }
    let total: usize = results.iter().map(|r| r.applied()).sum();
    assert_eq!(total, 4);

    let mut executed = project.db.executed_scripts();
    executed.dedup();
    assert_eq!(executed.len(), 4);
    assert_eq!(project.live_names().len(), 4);
    assert!(project.db.ledger_entries(SCHEMA, TABLE).iter().all(|e| e.success));
    assert_eq!(project.db.held_locks(), 0);
}

#[test]
fn test_rollback_makes_migration_pending_again() {
    let project = Project::new();
    project.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");
    project.write("20240101000000_a.down.sql", "DROP TABLE a;");

    assert!(project.direct().apply(RunMode::Cli).success());

    let rolled = project.direct().rollback_migration("20240101000000_a.sql", None);
    assert!(rolled.success(), "{:?}", rolled.error());
    assert_eq!(project.db.executed_scripts().last().unwrap(), "DROP TABLE a;");

    let entries = project.db.ledger_entries(SCHEMA, TABLE);
    assert_eq!(entries.len(), 1);
    assert!(entries[0].rolled_back_at.is_some());

    assert_eq!(project.direct().get_pending().unwrap(), vec!["20240101000000_a.sql"]);
    assert_eq!(project.direct().apply(RunMode::Cli).applied(), 1);
}

#[test]
fn test_drift_policies() {
    let mut project = Project::new();
    project.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");
    assert!(project.direct().apply(RunMode::Cli).success());

    project.write("20240101000000_a.sql", "CREATE TABLE a (id BIGINT);");
    project.write("20240102000000_b.sql", "CREATE TABLE b (id INT);");

    project.config.migrations.drift_policy = DriftPolicy::Block;
    let blocked = project.direct().apply(RunMode::Cli);
    assert_eq!(blocked.error_kind(), Some("checksum_mismatch"));
    assert_eq!(blocked.applied(), 0);

    project.config.migrations.drift_policy = DriftPolicy::Warn;
    let warned = project.direct().apply(RunMode::Cli);
    assert!(warned.success());
    assert_eq!(warned.applied(), 1);
    assert!(warned.detail("drift").is_some());
}

#[test]
fn test_checksum_ignores_file_location() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    fs::write(a.path().join("x.sql"), "SELECT 1;\n").unwrap();
    fs::write(b.path().join("y.sql"), "SELECT 1;\n").unwrap();

    let first = compute_checksum(&a.path().join("x.sql")).unwrap();
    assert_eq!(first, compute_checksum(&b.path().join("y.sql")).unwrap());
    assert_eq!(first, compute_checksum(&a.path().join("x.sql")).unwrap());

    fs::write(a.path().join("x.sql"), "SELECT 1; \n").unwrap();
    assert_ne!(first, compute_checksum(&a.path().join("x.sql")).unwrap());
}

#[test]
fn test_reset_guards_run_before_anything_else() {
    let project = Project::new();
    let runner = Arc::new(ScriptedRunner::new());

    // Tool missing and confirmation given: the production guard still wins
    let prod = DelegatedCliExecutor::new(project.context("production"), runner.clone());
    let result = prod.reset(true);
    assert_eq!(result.error_kind(), Some("guard_rejected"));
    assert!(result.error().unwrap().contains("production"));

    let local = DelegatedCliExecutor::new(project.context("local"), runner.clone());
    let result = local.reset(false);
    assert_eq!(result.error_kind(), Some("guard_rejected"));
    assert!(result.error().unwrap().contains("confirm"));

    assert!(runner.calls().is_empty());
    assert_eq!(project.db.connections_opened(), 0);
}

#[test]
fn test_delegated_apply_and_reconcile() {
    let project = Project::new();
    project.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");
    project.write("20240102000000_b.sql", "CREATE TABLE b (id INT);");

    let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
    runner.push_output(CommandOutput::success(
        "Applying migration 20240101000000_a.sql...\nApplied migration 20240101000000_a.sql\n",
    ));
    let executor = DelegatedCliExecutor::new(project.context("local"), runner.clone());

    // Before the tool has ever run, nothing is applied
    assert_eq!(executor.get_pending().unwrap().len(), 2);

    let result = executor.apply(RunMode::Cli);
    assert!(result.success(), "{:?}", result.error());
    assert_eq!(result.applied(), 1);
    assert_eq!(runner.calls()[0].args[..2], ["db".to_string(), "push".to_string()]);
    assert_eq!(project.db.held_locks(), 0);

    project
        .db
        .set_external_versions("supabase_migrations", "schema_migrations", &["20240101000000"]);
    assert_eq!(executor.get_applied().unwrap(), vec!["20240101000000_a.sql"]);
    assert_eq!(executor.get_pending().unwrap(), vec!["20240102000000_b.sql"]);
}

#[test]
fn test_engine_selects_delegated_executor_from_config() {
    let mut project = Project::new();
    project.config.migrations.use_supabase_cli = true;
    project.write("20240101000000_a.sql", "SELECT 1;");

    let runner = Arc::new(ScriptedRunner::new());
    let mut engine = MigrationEngine::from_context(project.context("local")).with_runner(runner);
    assert_eq!(engine.executor().name(), "supabase");

    let result = engine.apply_migrations(RunMode::Cli);
    assert_eq!(result.error_kind(), Some("tool_unavailable"));
    assert!(result.error().unwrap().contains("npm install -g supabase"));
}
