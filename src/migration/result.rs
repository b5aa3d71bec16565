//! Structured outcome of an executor operation

use crate::migration::MigrationError;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Outcome of `apply`, `rollback_migration` or `reset`
///
/// `success()` is derived from the absence of an error, so a failed result
/// always carries a message. `applied` keeps counting on failure: it is how
/// operators see where a batch stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    applied: usize,
    skipped: usize,
    error: Option<String>,
    error_kind: Option<&'static str>,
    details: BTreeMap<String, Value>,
}

impl ExecutionResult {
    /// A successful result with nothing applied yet
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failed result with an operator-facing message
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        let mut result = Self::default();
        result.fail_with(message);
        result
    }

    #[must_use]
    pub fn from_error(error: &MigrationError) -> Self {
        let mut result = Self::default();
        result.fail(error);
        result
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    #[must_use]
    pub fn applied(&self) -> usize {
        self.applied
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Category of the failure (`lock_unavailable`, `execution`, ...)
    #[must_use]
    pub fn error_kind(&self) -> Option<&'static str> {
        self.error_kind
    }

    #[must_use]
    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    #[must_use]
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn record_applied(&mut self) {
        self.applied += 1;
    }

    pub fn add_applied(&mut self, count: usize) {
        self.applied += count;
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Mark the result failed with `error`
    ///
    /// The first failure wins; later calls only log.
    pub fn fail(&mut self, error: &MigrationError) {
        if self.error.is_some() {
            log::debug!("Ignoring secondary failure: {error}");
            return;
        }
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind());
    }

    /// Mark the result failed with a free-form message
    pub fn fail_with(&mut self, message: impl Into<String>) {
        if self.error.is_some() {
            return;
        }
        let message = message.into();
        self.error = Some(if message.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            message
        });
    }

    pub fn set_detail(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.details.insert(key.into(), value.into());
    }

    /// JSON form for machine consumers (`--json` output, CI logs)
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success(),
            "applied": self.applied,
            "skipped": self.skipped,
            "error": self.error,
            "error_kind": self.error_kind,
            "details": self.details,
        })
    }
}
