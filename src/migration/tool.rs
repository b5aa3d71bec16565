//! External migration tool invocation
//!
//! [`CommandRunner`] is the process boundary: [`SystemRunner`] spawns real
//! processes, tests use a scripted runner. [`SupabaseCli`] builds the
//! `supabase db ...` command lines and interprets their output.
//!
//! Output parsing is best-effort telemetry. The exit status is the only
//! success signal.

use crate::migration::MigrationError;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use wait_timeout::ChildExt;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use std::os::unix::process::CommandExt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// `db push` and `db reset` can run arbitrary DDL
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(300);
pub const RESET_TIMEOUT: Duration = Duration::from_secs(300);
/// Diagnostic commands
pub const DIFF_TIMEOUT: Duration = Duration::from_secs(60);
pub const DRY_RUN_TIMEOUT: Duration = Duration::from_secs(60);
pub const GEN_TYPES_TIMEOUT: Duration = Duration::from_secs(60);
pub const LINT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for pipe readers once the process itself has exited
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Schema and table where the Supabase CLI records applied versions
pub const SUPABASE_LEDGER_SCHEMA: &str = "supabase_migrations";
pub const SUPABASE_LEDGER_TABLE: &str = "schema_migrations";

const SUPABASE_BINARY: &str = "supabase";
const INSTALL_HINT: &str = "Run: npm install -g supabase";

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[must_use]
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr if the process wrote any, otherwise stdout
    #[must_use]
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Failure to run a process to completion
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {}s", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    #[error("failed to collect output of {program}: {reason}")]
    Output { program: String, reason: String },
}

/// Runs external programs
pub trait CommandRunner: Send + Sync {
    /// Resolve `program` on the search path
    fn locate(&self, program: &str) -> Option<PathBuf>;

    /// Run `program` to completion, killing it after `timeout`
    ///
    /// # Errors
    ///
    /// Returns `CommandError` if the process cannot be started, times out or
    /// its output cannot be read. A non-zero exit is *not* an error here.
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] backed by `std::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .flat_map(|dir| {
                [
                    dir.join(program),
                    dir.join(format!("{program}{}", std::env::consts::EXE_SUFFIX)),
                ]
            })
            .find(|candidate| candidate.is_file())
    }

    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, CommandError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::subprocess_span(program).entered();

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout also reaches anything the tool forked.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

        // Drain both pipes while waiting, or a chatty child blocks on a full pipe.
        // Readers are detached: a grandchild may hold the pipes open past our deadline.
        let (stdout_tx, stdout_rx) = mpsc::channel();
        let (stderr_tx, stderr_rx) = mpsc::channel();
        if let Some(pipe) = child.stdout.take() {
            std::thread::spawn(move || {
                let _ = stdout_tx.send(read_pipe(pipe));
            });
        }
        if let Some(pipe) = child.stderr.take() {
            std::thread::spawn(move || {
                let _ = stderr_tx.send(read_pipe(pipe));
            });
        }

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                kill_tree(&mut child);
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                });
            }
            Err(e) => {
                kill_tree(&mut child);
                return Err(CommandError::Output {
                    program: program.to_string(),
                    reason: format!("wait failed: {e}"),
                });
            }
        };

        let collect = |rx: mpsc::Receiver<io::Result<String>>| match rx.recv_timeout(OUTPUT_GRACE) {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(CommandError::Output {
                program: program.to_string(),
                reason: e.to_string(),
            }),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("{program} exited but a background process still holds its output open");
                Ok(String::new())
            }
            // Pipe was never opened, or the reader panicked
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(String::new()),
        };

        Ok(CommandOutput {
            code: status.code(),
            stdout: collect(stdout_rx)?,
            stderr: collect(stderr_rx)?,
        })
    }
}

/// Kill the child and, on unix, every process in its group
fn kill_tree(child: &mut Child) {
    kill_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

fn read_pipe(mut pipe: impl Read) -> io::Result<String> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parsed result of `supabase db push`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Migrations the tool reported as applied (or, for a dry run, as pending)
    pub count: usize,
    pub message: String,
    pub output: String,
}

/// Parsed result of `supabase db diff`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    pub has_changes: bool,
    pub diff_sql: String,
}

/// Result of `supabase db lint`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintOutcome {
    /// The linter exited cleanly
    pub passed: bool,
    /// Non-blank lines of linter output
    pub findings: Vec<String>,
}

/// Count "Applied migration" markers in push output
#[must_use]
pub fn count_applied(output: &str) -> usize {
    output.matches("Applied migration").count()
}

/// Count "Would apply migration" markers in dry-run output
#[must_use]
pub fn count_would_apply(output: &str) -> usize {
    output.matches("Would apply migration").count()
}

/// Migration names listed in dry-run output, in the order the tool reported them
#[must_use]
pub fn would_apply_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once("Would apply migration"))
        .map(|(_, rest)| rest.trim().trim_end_matches("...").to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Interpret successful push output
#[must_use]
pub fn parse_push_output(output: &str, dry_run: bool) -> PushOutcome {
    let (count, message) = if dry_run {
        let count = count_would_apply(output);
        (count, format!("{count} migration(s) would be applied"))
    } else {
        let count = count_applied(output);
        if count == 0 && output.contains("No migrations") {
            (0, "No pending migrations".to_string())
        } else {
            (count, format!("Applied {count} migration(s)"))
        }
    };
    PushOutcome {
        count,
        message,
        output: output.to_string(),
    }
}

/// Interpret successful diff output
#[must_use]
pub fn parse_diff_output(stdout: &str) -> DiffOutcome {
    let diff_sql = stdout.trim().to_string();
    DiffOutcome {
        has_changes: !diff_sql.is_empty() && diff_sql != "-- No changes",
        diff_sql,
    }
}

/// `--workdir` for a migrations directory laid out as `<project>/supabase/migrations`
///
/// The CLI looks for `supabase/migrations` below its working directory, so
/// the project root is passed explicitly. Other layouts get no flag.
#[must_use]
pub fn project_workdir(migrations_dir: &Path) -> Option<PathBuf> {
    let parent = migrations_dir.parent()?;
    if migrations_dir.file_name()? != "migrations" || parent.file_name()? != "supabase" {
        return None;
    }
    let root = parent.parent()?;
    Some(if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root.to_path_buf()
    })
}

/// The Supabase CLI, driven with `--db-url` so it works against self-hosted databases
#[derive(Clone)]
pub struct SupabaseCli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl SupabaseCli {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: SUPABASE_BINARY.to_string(),
        }
    }

    /// Use a different executable name or path
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.runner.locate(&self.binary).is_some()
    }

    /// # Errors
    ///
    /// Returns `MigrationError::ToolUnavailable` if the binary cannot be found.
    pub fn ensure_available(&self) -> Result<(), MigrationError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(MigrationError::ToolUnavailable {
                tool: "Supabase".to_string(),
                hint: INSTALL_HINT.to_string(),
            })
        }
    }

    /// `supabase db push --db-url <url> [--dry-run]`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Command` on a non-zero exit or timeout.
    pub fn push(&self, db_url: &str, migrations_dir: &Path, dry_run: bool) -> Result<PushOutcome, MigrationError> {
        let mut args = db_args("push", db_url, migrations_dir);
        if dry_run {
            args.push("--dry-run".to_string());
        }
        let timeout = if dry_run { DRY_RUN_TIMEOUT } else { PUSH_TIMEOUT };

        let output = self.run("supabase db push", &args, timeout)?;
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        Ok(parse_push_output(&combined, dry_run))
    }

    /// `supabase db diff --db-url <url> [--file <name>]`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Command` on a non-zero exit or timeout.
    pub fn diff(
        &self,
        db_url: &str,
        migrations_dir: &Path,
        migration_name: Option<&str>,
    ) -> Result<DiffOutcome, MigrationError> {
        let mut args = db_args("diff", db_url, migrations_dir);
        if let Some(name) = migration_name {
            args.push("--file".to_string());
            args.push(name.to_string());
        }
        let output = self.run("supabase db diff", &args, DIFF_TIMEOUT)?;
        Ok(parse_diff_output(&output.stdout))
    }

    /// `supabase db reset --db-url <url>`: drops everything and reapplies
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Command` on a non-zero exit or timeout.
    pub fn reset(&self, db_url: &str, migrations_dir: &Path) -> Result<(), MigrationError> {
        let args = db_args("reset", db_url, migrations_dir);
        self.run("supabase db reset", &args, RESET_TIMEOUT)?;
        Ok(())
    }

    /// `supabase gen types typescript --db-url <url> --schema <schema>`, written to `output`
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Command` on a non-zero exit or timeout, and
    /// `MigrationError::Io` if `output` cannot be written.
    pub fn gen_types(&self, db_url: &str, schema: &str, output: &Path) -> Result<usize, MigrationError> {
        let args: Vec<String> = ["gen", "types", "typescript", "--db-url", db_url, "--schema", schema]
            .iter()
            .map(ToString::to_string)
            .collect();
        let generated = self.run("supabase gen types", &args, GEN_TYPES_TIMEOUT)?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| MigrationError::io(parent, e))?;
        }
        fs::write(output, &generated.stdout).map_err(|e| MigrationError::io(output, e))?;
        Ok(generated.stdout.len())
    }

    /// `supabase db lint --db-url <url>`
    ///
    /// Lint findings are not an error; a non-zero exit shows up as
    /// `passed == false`.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Command` if the linter cannot run or times out.
    pub fn lint(&self, db_url: &str, migrations_dir: &Path) -> Result<LintOutcome, MigrationError> {
        let args = db_args("lint", db_url, migrations_dir);
        let output = self.spawn("supabase db lint", &args, LINT_TIMEOUT)?;
        let findings = output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();
        Ok(LintOutcome {
            passed: output.is_success(),
            findings,
        })
    }

    fn spawn(&self, label: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, MigrationError> {
        log::debug!("Running {label} (timeout {}s)", timeout.as_secs());
        self.runner
            .run(&self.binary, args, timeout)
            .map_err(|e| MigrationError::Command {
                command: label.to_string(),
                message: e.to_string(),
            })
    }

    fn run(&self, label: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, MigrationError> {
        let output = self.spawn(label, args, timeout)?;

        if output.is_success() {
            Ok(output)
        } else {
            let mut message = output.error_text();
            if message.is_empty() {
                message = match output.code {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_string(),
                };
            }
            Err(MigrationError::Command {
                command: label.to_string(),
                message,
            })
        }
    }
}

fn db_args(subcommand: &str, db_url: &str, migrations_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "db".to_string(),
        subcommand.to_string(),
        "--db-url".to_string(),
        db_url.to_string(),
    ];
    if let Some(workdir) = project_workdir(migrations_dir) {
        args.push("--workdir".to_string());
        args.push(workdir.display().to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    #[test]
    fn test_count_applied() {
        let output = "Applying migration 20240101000000_initial.sql...\n\
                      Applied migration 20240101000000_initial.sql\n\
                      Applied migration 20240102000000_add_email.sql\n";
        assert_eq!(count_applied(output), 2);
        assert_eq!(parse_push_output(output, false).message, "Applied 2 migration(s)");
    }

    #[test]
    fn test_no_migrations_output() {
        let outcome = parse_push_output("Remote database is up to date.\nNo migrations to apply", false);
        assert_eq!(outcome.count, 0);
        assert_eq!(outcome.message, "No pending migrations");
    }

    #[test]
    fn test_dry_run_output() {
        let output = "Would apply migration 20240101000000_initial.sql\nWould apply migration 20240102000000_add_email.sql";
        let outcome = parse_push_output(output, true);
        assert_eq!(outcome.count, 2);
    }

    #[test]
    fn test_parse_diff_output() {
        assert!(!parse_diff_output("").has_changes);
        assert!(!parse_diff_output("  -- No changes\n").has_changes);
        let diff = parse_diff_output("ALTER TABLE users ADD COLUMN email text;\n");
        assert!(diff.has_changes);
        assert_eq!(diff.diff_sql, "ALTER TABLE users ADD COLUMN email text;");
    }

    #[test]
    fn test_project_workdir() {
        assert_eq!(
            project_workdir(Path::new("/srv/app/supabase/migrations")),
            Some(PathBuf::from("/srv/app"))
        );
        assert_eq!(project_workdir(Path::new("supabase/migrations")), Some(PathBuf::from(".")));
        assert_eq!(project_workdir(Path::new("db/migrations")), None);
        assert_eq!(project_workdir(Path::new("migrations")), None);
    }

    #[test]
    fn test_push_builds_command_line() {
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_output(CommandOutput::success("Applied migration 20240101000000_initial.sql"));
        let cli = SupabaseCli::new(runner.clone());

        let outcome = cli
            .push("postgres://localhost/app", Path::new("/srv/app/supabase/migrations"), false)
            .unwrap();
        assert_eq!(outcome.count, 1);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "supabase");
        assert_eq!(
            calls[0].args,
            vec!["db", "push", "--db-url", "postgres://localhost/app", "--workdir", "/srv/app"]
        );
        assert_eq!(calls[0].timeout, PUSH_TIMEOUT);
    }

    #[test]
    fn test_dry_run_uses_short_timeout() {
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        let cli = SupabaseCli::new(runner.clone());
        cli.push("postgres://localhost/app", Path::new("db"), true).unwrap();

        let calls = runner.calls();
        assert!(calls[0].args.contains(&"--dry-run".to_string()));
        assert_eq!(calls[0].timeout, DRY_RUN_TIMEOUT);
        assert!(DRY_RUN_TIMEOUT < PUSH_TIMEOUT);
    }

    #[test]
    fn test_non_zero_exit_is_error_with_stderr() {
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_output(CommandOutput::failure(1, "ERROR: relation \"users\" already exists"));
        let cli = SupabaseCli::new(runner);

        let err = cli.push("postgres://localhost/app", Path::new("db"), false).unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_timeout_is_error() {
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_timeout();
        let cli = SupabaseCli::new(runner);

        let err = cli.reset("postgres://localhost/app", Path::new("db")).unwrap_err();
        assert!(err.to_string().contains("did not finish"));
    }

    #[test]
    fn test_would_apply_names() {
        let output = "Connecting to remote database...\n\
                      Would apply migration 20240101000000_initial.sql...\n\
                      Would apply migration 20240102000000_add_email.sql\n";
        assert_eq!(
            would_apply_names(output),
            vec!["20240101000000_initial.sql", "20240102000000_add_email.sql"]
        );
        assert!(would_apply_names("Remote database is up to date.").is_empty());
    }

    #[test]
    fn test_gen_types_writes_stdout_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("src/types/supabase.ts");
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_output(CommandOutput::success("export type Json = string | number\n"));
        let cli = SupabaseCli::new(runner.clone());

        let written = cli.gen_types("postgres://localhost/app", "public", &target).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "export type Json = string | number\n");
        assert_eq!(written, 35);

        let calls = runner.calls();
        assert_eq!(
            calls[0].args,
            vec!["gen", "types", "typescript", "--db-url", "postgres://localhost/app", "--schema", "public"]
        );
        assert_eq!(calls[0].timeout, GEN_TYPES_TIMEOUT);
    }

    #[test]
    fn test_gen_types_failure_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("types.ts");
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_output(CommandOutput::failure(1, "failed to connect to postgres"));
        let cli = SupabaseCli::new(runner);

        let err = cli.gen_types("postgres://localhost/app", "public", &target).unwrap_err();
        assert!(err.to_string().contains("failed to connect"));
        assert!(!target.exists());
    }

    #[test]
    fn test_lint_findings_do_not_fail() {
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_output(CommandOutput {
            code: Some(1),
            stdout: "\nextensions.f: unused variable \"x\"\n".to_string(),
            stderr: "lint found 1 issue\n".to_string(),
        });
        let cli = SupabaseCli::new(runner.clone());

        let outcome = cli.lint("postgres://localhost/app", Path::new("/srv/app/supabase/migrations")).unwrap();
        assert!(!outcome.passed);
        assert_eq!(
            outcome.findings,
            vec!["extensions.f: unused variable \"x\"", "lint found 1 issue"]
        );

        let calls = runner.calls();
        assert_eq!(
            calls[0].args,
            vec!["db", "lint", "--db-url", "postgres://localhost/app", "--workdir", "/srv/app"]
        );
        assert_eq!(calls[0].timeout, LINT_TIMEOUT);
    }

    #[test]
    fn test_lint_timeout_is_error() {
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_timeout();
        let cli = SupabaseCli::new(runner);
        assert_eq!(cli.lint("postgres://localhost/app", Path::new("db")).unwrap_err().kind(), "execution");
    }

    #[test]
    fn test_missing_binary() {
        let cli = SupabaseCli::new(Arc::new(ScriptedRunner::new()));
        assert!(!cli.is_available());
        assert!(matches!(
            cli.ensure_available(),
            Err(MigrationError::ToolUnavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_captures_output() {
        let runner = SystemRunner;
        let output = runner
            .run(
                "sh",
                &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
                Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(runner.locate("sh").is_some());
        assert!(runner.locate("definitely-not-a-real-binary-name").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_kills_on_timeout() {
        let err = SystemRunner
            .run("sleep", &["5".to_string()], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_returns_while_forked_child_holds_pipes() {
        // The shell forks `sleep`, which inherits stdout and would keep a joined reader blocked.
        let started = std::time::Instant::now();
        let err = SystemRunner
            .run(
                "sh",
                &["-c".to_string(), "sleep 4; echo x".to_string()],
                Duration::from_millis(200),
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    }
}
