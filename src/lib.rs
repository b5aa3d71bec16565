//! # Lockstep
//!
//! Advisory-locked PostgreSQL schema migrations.
//!
//! Concurrent `apply` runs from operators and CI coordinate through a
//! session-scoped advisory lock, every attempt lands in an append-only
//! ledger, and migrations are applied either directly over SQL or by
//! delegating to the Supabase CLI.

pub mod config;
pub mod connection;
pub mod metrics;
pub mod migration;
pub mod reporter;
pub mod session;
mod transaction;

#[cfg(any(test, feature = "mock"))]
pub mod testing;

pub use config::{DriftPolicy, LockstepConfig};
pub use connection::{Connector, PgConnector};
pub use migration::{ExecutionResult, MigrationEngine, MigrationError, RunMode};
pub use reporter::{LogReporter, Reporter};
pub use session::{DbError, PgSession, Session};
