//! Ledger entries: rows of the migration tracking table

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Where a migration run was started from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliedFrom {
    /// An operator's terminal
    Cli,
    /// A CI pipeline
    Ci,
}

impl AppliedFrom {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedFrom::Cli => "cli",
            AppliedFrom::Ci => "ci",
        }
    }
}

impl fmt::Display for AppliedFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppliedFrom {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cli" => Ok(AppliedFrom::Cli),
            "ci" => Ok(AppliedFrom::Ci),
            other => Err(format!("unknown applied_from value '{other}'")),
        }
    }
}

/// A row of the ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,

    /// Migration filename
    pub name: String,

    /// `SHA-256` checksum of the file content at the time of the attempt
    pub checksum: String,

    pub applied_at: DateTime<Utc>,

    /// Database role that ran the migration
    pub applied_by: Option<String>,

    pub execution_time_ms: i64,

    /// Whether the attempt committed
    pub success: bool,

    pub applied_from: AppliedFrom,

    /// Set when the migration was rolled back; the entry itself is kept
    pub rolled_back_at: Option<DateTime<Utc>>,

    /// Version of lockstep that wrote the entry
    pub tool_version: Option<String>,

    pub ci_run_id: Option<String>,
}

impl LedgerEntry {
    /// Successful and not rolled back
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.success && self.rolled_back_at.is_none()
    }
}

/// Values for a ledger insert; the database fills id, timestamps and role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub name: String,
    pub checksum: String,
    pub execution_time_ms: i64,
    pub success: bool,
    pub applied_from: AppliedFrom,
    pub tool_version: String,
    pub ci_run_id: Option<String>,
}

impl NewLedgerEntry {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        checksum: impl Into<String>,
        execution_time_ms: i64,
        success: bool,
        applied_from: AppliedFrom,
    ) -> Self {
        Self {
            name: name.into(),
            checksum: checksum.into(),
            execution_time_ms,
            success,
            applied_from,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            ci_run_id: None,
        }
    }

    #[must_use]
    pub fn with_ci_run_id(mut self, ci_run_id: Option<String>) -> Self {
        self.ci_run_id = ci_run_id;
        self
    }
}
