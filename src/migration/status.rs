//! Migration status summary

use crate::migration::ledger::Drift;
use serde::Serialize;

/// Snapshot of local files against the applied set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Number of local migration files
    pub total: usize,

    /// Number of applied migrations
    pub applied: usize,

    /// Number of pending migrations
    pub pending: usize,

    pub local_files: Vec<String>,

    /// In application order
    pub applied_files: Vec<String>,

    /// In execution order
    pub pending_files: Vec<String>,

    /// Name of the executor that produced the snapshot
    pub executor: String,

    /// Applied migrations whose files changed since they were applied
    pub drift: Vec<Drift>,

    /// Applied migrations with no file on disk
    pub missing: Vec<String>,
}

impl MigrationStatus {
    #[must_use]
    pub fn new(
        executor: impl Into<String>,
        local_files: Vec<String>,
        applied_files: Vec<String>,
        pending_files: Vec<String>,
    ) -> Self {
        Self {
            total: local_files.len(),
            applied: applied_files.len(),
            pending: pending_files.len(),
            local_files,
            applied_files,
            pending_files,
            executor: executor.into(),
            drift: Vec::new(),
            missing: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_drift(mut self, drift: Vec<Drift>) -> Self {
        self.drift = drift;
        self
    }

    #[must_use]
    pub fn with_missing(mut self, missing: Vec<String>) -> Self {
        self.missing = missing;
        self
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending == 0
    }

    /// Most recently applied migration
    #[must_use]
    pub fn latest_applied(&self) -> Option<&str> {
        self.applied_files.last().map(String::as_str)
    }

    /// Next migration `apply` would run
    #[must_use]
    pub fn next_pending(&self) -> Option<&str> {
        self.pending_files.first().map(String::as_str)
    }
}
