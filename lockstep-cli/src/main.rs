//! Lockstep migration CLI
//!
//! Command-line front-end for applying, inspecting and rolling back
//! migrations. Works the same from a terminal and from CI (`up --ci`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use lockstep::config::LockstepConfig;
use lockstep::migration::{
    create_down_migration, create_migration, validate_migration, ExecutionResult, ExecutorContext,
    MigrationEngine, RunMode,
};
use lockstep::Reporter;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(about = "Coordinated PostgreSQL schema migrations")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = lockstep::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Target environment
    #[arg(long = "env", env = "LOCKSTEP_ENV", default_value = "local")]
    environment: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show applied and pending migrations
    Status,

    /// Apply pending migrations
    Up {
        /// Record the run as a CI run
        #[arg(long)]
        ci: bool,

        /// List what would be applied without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back one applied migration
    Rollback {
        /// Migration filename, e.g. 20240101000000_initial.sql
        name: String,

        /// Rollback SQL to run instead of the .down.sql companion
        #[arg(long)]
        sql: Option<String>,
    },

    /// Show the schema diff reported by the migration tool
    Diff {
        /// Write the diff into a new migration with this name
        #[arg(long)]
        file: Option<String>,
    },

    /// Drop and rebuild the database from migrations
    Reset {
        /// Required; reset is destructive
        #[arg(long)]
        confirm: bool,
    },

    /// Create a new migration file
    New {
        /// What the migration does, e.g. "add email to users"
        description: String,
    },

    /// Create the .down.sql companion of an existing migration
    NewDown {
        /// Filename of the up migration
        name: String,
    },

    /// Check the environment, or one migration file
    Validate {
        /// Migration file to check
        file: Option<PathBuf>,
    },

    /// Generate TypeScript types from the database schema
    GenTypes {
        /// Where to write the generated types
        #[arg(long, default_value = "src/types/supabase.ts")]
        output: PathBuf,

        /// Database schema to generate types for
        #[arg(long, default_value = "public")]
        schema: String,
    },

    /// Lint the database schema with the migration tool
    Lint,

    /// Show whether the migration lock is held
    Lock,
}

/// Prints executor narration to the terminal
///
/// With `--json` everything goes to stderr so stdout stays machine readable.
struct ConsoleReporter {
    quiet: bool,
    to_stderr: bool,
}

impl ConsoleReporter {
    fn emit(&self, line: String) {
        if self.to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

impl Reporter for ConsoleReporter {
    fn progress(&self, message: &str) {
        if !self.quiet {
            self.emit(format!("{} {message}", "→".cyan()));
        }
    }

    fn success(&self, message: &str) {
        if !self.quiet {
            self.emit(format!("{} {message}", "✓".green()));
        }
    }

    fn warning(&self, message: &str) {
        self.emit(format!("{} {}", "!".yellow(), message.yellow()));
    }

    fn failure(&self, message: &str) {
        eprintln!("{} {}", "✗".red(), message.red());
    }
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(true) => process::exit(0),
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            process::exit(1);
        }
    }
}

/// Returns whether the command succeeded
fn run(cli: Cli) -> Result<bool> {
    let config = LockstepConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let migrations_dir = config.migrations_directory().to_path_buf();

    let reporter = Arc::new(ConsoleReporter {
        quiet: cli.quiet,
        to_stderr: cli.json,
    });
    let context = ExecutorContext::new(Arc::new(config), cli.environment.clone()).with_reporter(reporter);
    let mut engine = MigrationEngine::from_context(context);

    match cli.command {
        Commands::New { description } => {
            let path = create_migration(&migrations_dir, &description)?;
            println!("{} Created {}", "✓".green(), path.display());
            Ok(true)
        }
        Commands::NewDown { name } => {
            let path = create_down_migration(&migrations_dir, &name)?;
            println!("{} Created {}", "✓".green(), path.display());
            Ok(true)
        }
        Commands::Validate { file: Some(file) } => Ok(handle_validate_file(&file, cli.json)),
        Commands::Status => handle_status(&mut engine, cli.json),
        Commands::Up { ci, dry_run: true } => handle_dry_run(&mut engine, ci, cli.json),
        Commands::Up { ci, dry_run: false } => {
            let mode = if ci { RunMode::Ci } else { RunMode::Cli };
            Ok(report(&engine.apply_migrations(mode), cli.json, "applied"))
        }
        Commands::Rollback { name, sql } => {
            Ok(report(&engine.rollback(&name, sql.as_deref()), cli.json, "rolled back"))
        }
        Commands::Diff { file } => handle_diff(&mut engine, file.as_deref(), cli.json),
        Commands::Reset { confirm } => Ok(report(&engine.reset(confirm), cli.json, "reset")),
        Commands::Validate { file: None } => {
            engine.validate_environment()?;
            println!("{} Environment '{}' is ready", "✓".green(), cli.environment);
            Ok(true)
        }
        Commands::GenTypes { output, schema } => {
            let written = engine.gen_types(&schema, &output)?;
            if cli.json {
                println!("{}", serde_json::json!({ "output": output, "bytes": written }));
            } else {
                println!("{} Wrote types for '{schema}' to {}", "✓".green(), output.display());
            }
            Ok(true)
        }
        Commands::Lint => handle_lint(&mut engine, cli.json),
        Commands::Lock => {
            let held = engine.lock_status()?;
            if cli.json {
                println!("{}", serde_json::json!({ "locked": held }));
            } else if held {
                println!("{} Migration lock is held by another session", "!".yellow());
            } else {
                println!("{} Migration lock is free", "✓".green());
            }
            Ok(true)
        }
    }
}

fn report(result: &ExecutionResult, json: bool, verb: &str) -> bool {
    if json {
        println!("{}", result.to_json());
        return result.success();
    }

    match result.error() {
        None => println!(
            "{} {} migration(s) {verb}{}",
            "✓".green(),
            result.applied(),
            if result.skipped() > 0 {
                format!(", {} skipped", result.skipped())
            } else {
                String::new()
            }
        ),
        Some(error) => {
            eprintln!("{} {error}", "✗".red());
            eprintln!("  {} migration(s) {verb} before the failure", result.applied());
        }
    }
    result.success()
}

fn handle_status(engine: &mut MigrationEngine, json: bool) -> Result<bool> {
    let status = engine.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(true);
    }

    println!("\n{} ({} executor)\n", "Migration Status".bold(), status.executor);

    if status.applied_files.is_empty() {
        println!("Applied: none");
    } else {
        println!("Applied ({}):", status.applied);
        for name in &status.applied_files {
            println!("  {} {name}", "✓".green());
        }
    }

    println!();

    if status.pending_files.is_empty() {
        println!("Pending: none");
    } else {
        println!("Pending ({}):", status.pending);
        for name in &status.pending_files {
            println!("  {} {name}", "…".yellow());
        }
    }

    for drift in &status.drift {
        println!("  {} {} changed since it was applied", "!".yellow(), drift.name);
    }
    for name in &status.missing {
        println!("  {} {name} is applied but its file is gone", "!".yellow());
    }

    println!("\nSummary: {} applied, {} pending", status.applied, status.pending);
    Ok(true)
}

fn handle_dry_run(engine: &mut MigrationEngine, ci: bool, json: bool) -> Result<bool> {
    let pending = engine.dry_run()?;

    if json {
        println!("{}", serde_json::json!({ "dry_run": true, "ci": ci, "pending": pending }));
    } else if pending.is_empty() {
        println!("No pending migrations to apply");
    } else {
        println!("Would apply {} migration(s):", pending.len());
        for (i, name) in pending.iter().enumerate() {
            println!("  {}. {name}", i + 1);
        }
    }
    Ok(true)
}

fn handle_diff(engine: &mut MigrationEngine, file: Option<&str>, json: bool) -> Result<bool> {
    let diff = engine.diff(file)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "has_changes": diff.has_changes, "diff": diff.diff_sql })
        );
    } else if diff.has_changes {
        println!("{}", diff.diff_sql);
    } else {
        println!("{} No schema changes", "✓".green());
    }
    Ok(true)
}

fn handle_lint(engine: &mut MigrationEngine, json: bool) -> Result<bool> {
    let outcome = engine.lint()?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "passed": outcome.passed, "findings": outcome.findings })
        );
    } else if outcome.findings.is_empty() {
        println!("{} No lint findings", "✓".green());
    } else {
        for finding in &outcome.findings {
            println!("  {} {finding}", "!".yellow());
        }
    }
    Ok(outcome.passed)
}

fn handle_validate_file(path: &Path, json: bool) -> bool {
    let problems = validate_migration(path);
    let ok = !problems.iter().any(|p| !p.starts_with("Warning:"));

    if json {
        println!("{}", serde_json::json!({ "file": path, "ok": ok, "problems": problems }));
    } else if problems.is_empty() {
        println!("{} {} looks fine", "✓".green(), path.display());
    } else {
        for problem in &problems {
            println!("  {} {problem}", "!".yellow());
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep::migration::CommandOutput;
    use lockstep::testing::{MemoryDatabase, RecordingReporter, ScriptedRunner};

    #[test]
    fn test_parse_up_ci() {
        let cli = Cli::try_parse_from(["lockstep", "--env", "staging", "up", "--ci"]).unwrap();
        assert_eq!(cli.environment, "staging");
        assert!(matches!(cli.command, Commands::Up { ci: true, dry_run: false }));
    }

    #[test]
    fn test_parse_rollback_with_sql() {
        let cli = Cli::try_parse_from([
            "lockstep",
            "rollback",
            "20240101000000_initial.sql",
            "--sql",
            "DROP TABLE users;",
        ])
        .unwrap();
        match cli.command {
            Commands::Rollback { name, sql } => {
                assert_eq!(name, "20240101000000_initial.sql");
                assert_eq!(sql.as_deref(), Some("DROP TABLE users;"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_reset_defaults_to_unconfirmed() {
        let cli = Cli::try_parse_from(["lockstep", "reset"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { confirm: false }));
    }

    #[test]
    fn test_json_flag_is_global() {
        let cli = Cli::try_parse_from(["lockstep", "status", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["lockstep", "-v", "-q", "status"]).is_err());
    }

    #[test]
    fn test_parse_gen_types_defaults() {
        let cli = Cli::try_parse_from(["lockstep", "gen-types"]).unwrap();
        match cli.command {
            Commands::GenTypes { output, schema } => {
                assert_eq!(output, PathBuf::from("src/types/supabase.ts"));
                assert_eq!(schema, "public");
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(matches!(
            Cli::try_parse_from(["lockstep", "lint"]).unwrap().command,
            Commands::Lint
        ));
    }

    fn supabase_engine(dir: &Path, runner: Arc<ScriptedRunner>) -> MigrationEngine {
        let mut config = LockstepConfig::new("app", dir).with_environment_url("local", "postgres://localhost/app");
        config.migrations.format = "supabase".to_string();
        let context = ExecutorContext::new(Arc::new(config), "local")
            .with_connector(Arc::new(MemoryDatabase::new()))
            .with_reporter(Arc::new(RecordingReporter::new()));
        MigrationEngine::from_context(context).with_runner(runner)
    }

    #[test]
    fn test_dry_run_goes_through_the_cli_tool() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240101000000_initial.sql"), "SELECT 1;").unwrap();
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_output(CommandOutput::success("Would apply migration 20240101000000_initial.sql"));

        let mut engine = supabase_engine(dir.path(), runner.clone());
        assert!(handle_dry_run(&mut engine, false, true).unwrap());

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].args.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn test_lint_exit_status_follows_findings() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().with_binary("supabase"));
        runner.push_output(CommandOutput::failure(1, "public.f: unused variable"));
        runner.push_output(CommandOutput::success(""));

        let mut engine = supabase_engine(dir.path(), runner);
        assert!(!handle_lint(&mut engine, true).unwrap());
        assert!(handle_lint(&mut engine, true).unwrap());
    }

    #[test]
    fn test_validate_file_reports_empty_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sql");
        std::fs::write(&path, "").unwrap();
        assert!(!handle_validate_file(&path, true));

        std::fs::write(&path, "DROP TABLE legacy;").unwrap();
        assert!(handle_validate_file(&path, true));
    }
}
