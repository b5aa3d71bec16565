//! Migration subsystem
//!
//! This module provides:
//! - Advisory-lock based mutual exclusion across processes ([`lock`])
//! - The append-only migration ledger ([`ledger`])
//! - The executor abstraction with direct SQL and delegated CLI strategies
//! - File discovery, checksums and the migration generator
//!
//! # Example
//!
//! ```rust,no_run
//! use lockstep::config::LockstepConfig;
//! use lockstep::migration::{MigrationEngine, RunMode};
//! use std::sync::Arc;
//!
//! let config = LockstepConfig::load().expect("lockstep.toml");
//! let mut engine = MigrationEngine::new(Arc::new(config), "staging");
//!
//! let result = engine.apply_migrations(RunMode::Ci);
//! if !result.success() {
//!     eprintln!("stopped after {} migration(s): {}", result.applied(), result.error().unwrap_or_default());
//! }
//! ```

pub mod checksum;
pub mod delegated;
pub mod direct;
pub mod engine;
pub mod error;
pub mod executor;
pub mod file;
pub mod generator;
pub mod ledger;
pub mod lock;
pub mod record;
pub mod result;
pub mod status;
pub mod tool;

pub use checksum::compute_checksum;
pub use delegated::DelegatedCliExecutor;
pub use direct::DirectSqlExecutor;
pub use engine::{validate_migration, MigrationEngine};
pub use error::MigrationError;
pub use executor::{
    build_executor, executor_for, ExecutorContext, ExecutorKind, MigrationExecutor, RunMode,
};
pub use file::{discover_migrations, MigrationFile};
pub use generator::{create_down_migration, create_migration, generate_migration_name};
pub use ledger::{Drift, Ledger, LedgerTable};
pub use lock::{lock_id_for, migration_lock, AdvisoryLock, LockGuard};
pub use record::{AppliedFrom, LedgerEntry, NewLedgerEntry};
pub use result::ExecutionResult;
pub use status::MigrationStatus;
pub use tool::{
    CommandOutput, CommandRunner, DiffOutcome, LintOutcome, PushOutcome, SupabaseCli, SystemRunner,
};
