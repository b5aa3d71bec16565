//! Migration file discovery and naming conventions
//!
//! Migration files are plain SQL named `{timestamp}_{description}.sql`, for
//! example `20240101000000_initial.sql`. Lexicographic filename order is
//! execution order. A companion `{stem}.down.sql` holds rollback SQL and is
//! never treated as a migration itself.

use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix of rollback companion files
pub const DOWN_SUFFIX: &str = ".down.sql";

static TIMESTAMP_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{14}_").unwrap_or_else(|e| panic!("invalid timestamp regex: {e}"))
});

/// Represents a discovered migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// Path to the migration file
    pub path: PathBuf,

    /// File name, which is also the ledger key
    pub filename: String,

    /// Text before the first `_`; the version external tools record
    pub ordinal_prefix: String,
}

impl MigrationFile {
    #[must_use]
    pub fn new(path: PathBuf, filename: String) -> Self {
        let ordinal_prefix = ordinal_prefix(&filename).to_string();
        Self {
            path,
            filename,
            ordinal_prefix,
        }
    }

    /// Whether the name starts with a `YYYYMMDDHHMMSS_` timestamp
    #[must_use]
    pub fn has_timestamp_prefix(&self) -> bool {
        TIMESTAMP_PREFIX.is_match(&self.filename)
    }
}

/// Text before the first `_`, or the stem when the name has no underscore
///
/// # Example
/// - `20240101000000_initial.sql` → `20240101000000`
#[must_use]
pub fn ordinal_prefix(filename: &str) -> &str {
    match filename.split_once('_') {
        Some((prefix, _)) => prefix,
        None => filename.strip_suffix(".sql").unwrap_or(filename),
    }
}

/// Whether `filename` is a rollback companion rather than a migration
#[must_use]
pub fn is_down_file(filename: &str) -> bool {
    filename.ends_with(DOWN_SUFFIX)
}

/// Path of the rollback companion for `migration_name` in `migrations_dir`
///
/// `20240101000000_initial.sql` → `20240101000000_initial.down.sql`
#[must_use]
pub fn down_file_path(migrations_dir: &Path, migration_name: &str) -> PathBuf {
    let stem = migration_name
        .strip_suffix(".sql")
        .unwrap_or(migration_name);
    migrations_dir.join(format!("{stem}{DOWN_SUFFIX}"))
}

/// Discover all migration files in a directory
///
/// Returns `.sql` files (excluding `.down.sql` companions) sorted by filename,
/// independent of the order the filesystem lists them in. A missing directory
/// yields an empty list.
///
/// # Errors
///
/// Returns `MigrationError::Io` if the directory exists but cannot be read,
/// and `MigrationError::InvalidFormat` if the path is not a directory.
pub fn discover_migrations(migrations_dir: &Path) -> Result<Vec<MigrationFile>, MigrationError> {
    if !migrations_dir.exists() {
        return Ok(Vec::new());
    }

    if !migrations_dir.is_dir() {
        return Err(MigrationError::InvalidFormat(format!(
            "Path is not a directory: {}",
            migrations_dir.display()
        )));
    }

    let entries = fs::read_dir(migrations_dir).map_err(|e| MigrationError::io(migrations_dir, e))?;

    let mut migrations = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MigrationError::io(migrations_dir, e))?;
        let path = entry.path();

        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }

        let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            log::warn!("Skipping migration with non UTF-8 name: {}", path.display());
            continue;
        };

        if is_down_file(&filename) {
            continue;
        }

        let file = MigrationFile::new(path, filename);
        if !file.has_timestamp_prefix() {
            log::warn!(
                "Migration {} has no YYYYMMDDHHMMSS_ prefix; ordering and version matching rely on it",
                file.filename
            );
        }
        migrations.push(file);
    }

    migrations.sort_by(|a, b| a.filename.cmp(&b.filename));

    Ok(migrations)
}

/// Filenames of [`discover_migrations`], in execution order
///
/// # Errors
///
/// Same as [`discover_migrations`].
pub fn local_migration_names(migrations_dir: &Path) -> Result<Vec<String>, MigrationError> {
    Ok(discover_migrations(migrations_dir)?
        .into_iter()
        .map(|f| f.filename)
        .collect())
}
