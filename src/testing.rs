//! In-memory stand-ins for the database, the process boundary and the reporter
//!
//! Compiled for unit tests and with the `mock` feature. [`MemoryDatabase`]
//! mimics the PostgreSQL behavior the migration subsystem relies on:
//! session-scoped advisory locks released when a session is dropped, and a
//! ledger with a unique live entry per migration name.

use crate::connection::Connector;
use crate::migration::ledger::LedgerTable;
use crate::migration::record::{LedgerEntry, NewLedgerEntry};
use crate::migration::tool::{CommandError, CommandOutput, CommandRunner};
use crate::reporter::Reporter;
use crate::session::{DbError, Session};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type TableKey = (String, String);

fn key(schema: &str, table: &str) -> TableKey {
    (schema.to_string(), table.to_string())
}

struct DatabaseState {
    next_session_id: u64,
    connections_opened: usize,
    /// lock id -> (holding session, re-entry count)
    locks: HashMap<i64, (u64, u32)>,
    ledgers: BTreeMap<TableKey, Vec<LedgerEntry>>,
    external: BTreeMap<TableKey, Vec<String>>,
    next_entry_id: i64,
    clock: DateTime<Utc>,
    executed: Vec<String>,
    failing_patterns: Vec<String>,
    script_delay: Duration,
    fail_lock_calls: bool,
    fail_connections: bool,
    fail_ledger_updates: bool,
}

impl DatabaseState {
    /// Strictly increasing timestamps keep `applied_at` ordering deterministic
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += ChronoDuration::milliseconds(1);
        self.clock
    }
}

/// A shared in-memory "database"; clones share state
#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DatabaseState {
                next_session_id: 1,
                connections_opened: 0,
                locks: HashMap::new(),
                ledgers: BTreeMap::new(),
                external: BTreeMap::new(),
                next_entry_id: 1,
                clock: Utc::now(),
                executed: Vec::new(),
                failing_patterns: Vec::new(),
                script_delay: Duration::ZERO,
                fail_lock_calls: false,
                fail_connections: false,
                fail_ledger_updates: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scripts containing `pattern` fail instead of executing
    pub fn fail_scripts_containing(&self, pattern: &str) {
        self.state().failing_patterns.push(pattern.to_string());
    }

    /// Make every script take this long, outside the state lock
    pub fn set_script_delay(&self, delay: Duration) {
        self.state().script_delay = delay;
    }

    /// Advisory lock calls fail as if the connection dropped
    pub fn fail_lock_calls(&self, fail: bool) {
        self.state().fail_lock_calls = fail;
    }

    /// Rollback stamps on the ledger fail, as if the connection dropped mid-transaction
    pub fn fail_ledger_updates(&self, fail: bool) {
        self.state().fail_ledger_updates = fail;
    }

    /// New connections are refused
    pub fn fail_connections(&self, fail: bool) {
        self.state().fail_connections = fail;
    }

    /// Drop every advisory lock without telling the sessions that hold them
    pub fn forget_locks(&self) {
        self.state().locks.clear();
    }

    /// Register the external tool's ledger with these versions
    pub fn set_external_versions(&self, schema: &str, table: &str, versions: &[&str]) {
        self.state()
            .external
            .insert(key(schema, table), versions.iter().map(ToString::to_string).collect());
    }

    /// Bodies of successfully executed scripts, in execution order
    #[must_use]
    pub fn executed_scripts(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    #[must_use]
    pub fn ledger_exists(&self, schema: &str, table: &str) -> bool {
        self.state().ledgers.contains_key(&key(schema, table))
    }

    #[must_use]
    pub fn ledger_entries(&self, schema: &str, table: &str) -> Vec<LedgerEntry> {
        self.state()
            .ledgers
            .get(&key(schema, table))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of advisory locks currently held by any session
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.state().locks.len()
    }

    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }
}

impl Connector for MemoryDatabase {
    fn open(&self, _url: &str) -> Result<Box<dyn Session>, DbError> {
        let mut state = self.state();
        if state.fail_connections {
            return Err(DbError::Other("connection refused".to_string()));
        }
        let id = state.next_session_id;
        state.next_session_id += 1;
        state.connections_opened += 1;
        Ok(Box::new(MemorySession {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// One session on a [`MemoryDatabase`]; dropping it releases its locks
pub struct MemorySession {
    id: u64,
    state: Arc<Mutex<DatabaseState>>,
}

impl MemorySession {
    fn state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn missing_relation(table: &LedgerTable) -> DbError {
        DbError::Query(format!("relation {} does not exist", table.qualified()))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let id = self.id;
        self.state().locks.retain(|_, (holder, _)| *holder != id);
    }
}

impl Session for MemorySession {
    fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        self.execute_script(sql)
    }

    fn execute_script(&self, sql: &str) -> Result<(), DbError> {
        let delay = {
            let state = self.state();
            if let Some(pattern) = state.failing_patterns.iter().find(|p| sql.contains(p.as_str())) {
                return Err(DbError::Query(format!("syntax error at or near \"{pattern}\"")));
            }
            state.script_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.state().executed.push(sql.to_string());
        Ok(())
    }

    fn try_advisory_lock(&self, lock_id: i64, _timeout: Duration) -> Result<bool, DbError> {
        let mut state = self.state();
        if state.fail_lock_calls {
            return Err(DbError::Other("server closed the connection unexpectedly".to_string()));
        }
        match state.locks.get_mut(&lock_id) {
            Some((holder, count)) if *holder == self.id => {
                *count += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                state.locks.insert(lock_id, (self.id, 1));
                Ok(true)
            }
        }
    }

    fn advisory_unlock(&self, lock_id: i64) -> Result<bool, DbError> {
        let mut state = self.state();
        if state.fail_lock_calls {
            return Err(DbError::Other("server closed the connection unexpectedly".to_string()));
        }
        match state.locks.get_mut(&lock_id) {
            Some((holder, count)) if *holder == self.id => {
                *count -= 1;
                if *count == 0 {
                    state.locks.remove(&lock_id);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn advisory_lock_holders(&self, lock_id: i64) -> Result<i64, DbError> {
        let state = self.state();
        if state.fail_lock_calls {
            return Err(DbError::Other("server closed the connection unexpectedly".to_string()));
        }
        Ok(i64::from(state.locks.contains_key(&lock_id)))
    }

    fn table_exists(&self, schema: &str, table: &str) -> Result<bool, DbError> {
        let state = self.state();
        let k = key(schema, table);
        Ok(state.ledgers.contains_key(&k) || state.external.contains_key(&k))
    }

    fn ensure_ledger(&self, table: &LedgerTable) -> Result<(), DbError> {
        self.state()
            .ledgers
            .entry(key(table.schema(), table.table()))
            .or_default();
        Ok(())
    }

    fn insert_ledger_entry(&self, table: &LedgerTable, entry: &NewLedgerEntry) -> Result<(), DbError> {
        let mut state = self.state();
        let id = state.next_entry_id;
        let applied_at = state.tick();
        let entries = state
            .ledgers
            .get_mut(&key(table.schema(), table.table()))
            .ok_or_else(|| Self::missing_relation(table))?;

        if entry.success && entries.iter().any(|e| e.name == entry.name && e.is_live()) {
            return Err(DbError::Query(format!(
                "duplicate key value violates unique constraint: name={}",
                entry.name
            )));
        }

        entries.push(LedgerEntry {
            id,
            name: entry.name.clone(),
            checksum: entry.checksum.clone(),
            applied_at,
            applied_by: Some("postgres".to_string()),
            execution_time_ms: entry.execution_time_ms,
            success: entry.success,
            applied_from: entry.applied_from,
            rolled_back_at: None,
            tool_version: Some(entry.tool_version.clone()),
            ci_run_id: entry.ci_run_id.clone(),
        });
        state.next_entry_id += 1;
        Ok(())
    }

    fn ledger_entries(&self, table: &LedgerTable) -> Result<Vec<LedgerEntry>, DbError> {
        self.state()
            .ledgers
            .get(&key(table.schema(), table.table()))
            .cloned()
            .ok_or_else(|| Self::missing_relation(table))
    }

    fn rollback_and_mark(&self, table: &LedgerTable, name: &str, rollback_sql: &str) -> Result<u64, DbError> {
        // Everything is checked before anything changes, so a failure leaves no trace.
        let mut state = self.state();
        if let Some(pattern) = state
            .failing_patterns
            .iter()
            .find(|p| rollback_sql.contains(p.as_str()))
        {
            return Err(DbError::Query(format!("syntax error at or near \"{pattern}\"")));
        }
        if state.fail_ledger_updates {
            return Err(DbError::Other("server closed the connection unexpectedly".to_string()));
        }
        if !state.ledgers.contains_key(&key(table.schema(), table.table())) {
            return Err(Self::missing_relation(table));
        }

        state.executed.push(rollback_sql.to_string());
        let now = state.tick();
        let entries = state
            .ledgers
            .get_mut(&key(table.schema(), table.table()))
            .ok_or_else(|| Self::missing_relation(table))?;

        let mut stamped = 0;
        for entry in entries.iter_mut().filter(|e| e.name == name && e.is_live()) {
            entry.rolled_back_at = Some(now);
            stamped += 1;
        }
        Ok(stamped)
    }

    fn external_versions(&self, schema: &str, table: &str) -> Result<Vec<String>, DbError> {
        let mut versions = self
            .state()
            .external
            .get(&key(schema, table))
            .cloned()
            .ok_or_else(|| DbError::Query(format!("relation {schema}.{table} does not exist")))?;
        versions.sort();
        Ok(versions)
    }
}

/// A call made through [`ScriptedRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Default)]
struct RunnerState {
    binaries: HashSet<String>,
    responses: VecDeque<Result<CommandOutput, ()>>,
    calls: Vec<RecordedCall>,
}

/// [`CommandRunner`] that replays queued outputs and records every call
///
/// With nothing queued, a call succeeds with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    state: Mutex<RunnerState>,
}

impl ScriptedRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `binary` resolvable on the fake search path
    #[must_use]
    pub fn with_binary(self, binary: &str) -> Self {
        self.state().binaries.insert(binary.to_string());
        self
    }

    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_output(&self, output: CommandOutput) {
        self.state().responses.push_back(Ok(output));
    }

    /// The next call times out
    pub fn push_timeout(&self) {
        self.state().responses.push_back(Err(()));
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.state()
            .binaries
            .contains(program)
            .then(|| PathBuf::from("/usr/local/bin").join(program))
    }

    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, CommandError> {
        let mut state = self.state();
        state.calls.push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            timeout,
        });
        match state.responses.pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(())) => Err(CommandError::Timeout {
                program: program.to_string(),
                timeout,
            }),
            None => Ok(CommandOutput::success("")),
        }
    }
}

/// Message kinds seen by [`RecordingReporter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLevel {
    Progress,
    Success,
    Warning,
    Failure,
}

/// [`Reporter`] that keeps every message for assertions
#[derive(Default)]
pub struct RecordingReporter {
    messages: Mutex<Vec<(ReportLevel, String)>>,
}

impl RecordingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, level: ReportLevel, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, message.to_string()));
    }

    #[must_use]
    pub fn messages(&self) -> Vec<(ReportLevel, String)> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(level, _)| *level == ReportLevel::Warning)
            .map(|(_, message)| message)
            .collect()
    }

    /// Whether any message contains `needle`
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|(_, message)| message.contains(needle))
    }
}

impl Reporter for RecordingReporter {
    fn progress(&self, message: &str) {
        self.push(ReportLevel::Progress, message);
    }

    fn success(&self, message: &str) {
        self.push(ReportLevel::Success, message);
    }

    fn warning(&self, message: &str) {
        self.push(ReportLevel::Warning, message);
    }

    fn failure(&self, message: &str) {
        self.push(ReportLevel::Failure, message);
    }
}
