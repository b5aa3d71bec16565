//! Migration-specific error types

use crate::session::DbError;
use std::path::PathBuf;

/// Migration-specific errors
///
/// Executors convert every variant into an [`ExecutionResult`](super::ExecutionResult)
/// at their public boundary; the `Display` text is what operators read.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Missing or invalid configuration (database URL, directory, identifiers)
    #[error("{0}")]
    Configuration(String),

    /// Another session holds the migration lock
    #[error(
        "Could not acquire migration lock '{lock_name}'. Another migration may be running; \
         retry once it has finished."
    )]
    LockUnavailable { lock_name: String },

    /// Infrastructure failure while acquiring or releasing a lock
    #[error("Lock error: {0}")]
    Lock(String),

    /// A specific migration failed to execute
    #[error("Migration {name} failed: {message}")]
    Execution { name: String, message: String },

    /// An external command exited unsuccessfully or timed out
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    /// The external migration tool is not installed
    #[error("{tool} CLI not installed. {hint}")]
    ToolUnavailable { tool: String, hint: String },

    /// A safety guard refused the operation
    #[error("{0}")]
    GuardRejected(String),

    /// An applied migration's file no longer matches its recorded checksum
    #[error(
        "Migration '{name}' has been modified after being applied.\n\
         Recorded checksum: {recorded}\n\
         Current checksum: {current}"
    )]
    ChecksumMismatch {
        name: String,
        recorded: String,
        current: String,
    },

    /// Database error outside a specific migration body
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Filesystem error
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid migration file or name
    #[error("Invalid migration format: {0}")]
    InvalidFormat(String),
}

impl MigrationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrationError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable category, used in result details
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::Configuration(_) => "configuration",
            MigrationError::LockUnavailable { .. } => "lock_unavailable",
            MigrationError::Lock(_) => "lock",
            MigrationError::Execution { .. } => "execution",
            MigrationError::Command { .. } => "execution",
            MigrationError::ToolUnavailable { .. } => "tool_unavailable",
            MigrationError::GuardRejected(_) => "guard_rejected",
            MigrationError::ChecksumMismatch { .. } => "checksum_mismatch",
            MigrationError::Database(_) => "database",
            MigrationError::Io { .. } => "io",
            MigrationError::InvalidFormat(_) => "invalid_format",
        }
    }
}
