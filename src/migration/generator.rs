//! Migration file generator
//!
//! New migrations are named `YYYYMMDDHHMMSS_<description>.sql` (UTC), which
//! keeps filename order equal to creation order.

use crate::migration::file::{down_file_path, DOWN_SUFFIX};
use crate::migration::MigrationError;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Build a migration filename for `description` at `now`
///
/// The description is lowercased, spaces and hyphens become underscores and
/// anything else that is not alphanumeric is dropped.
///
/// # Errors
///
/// Returns `MigrationError::InvalidFormat` if nothing usable is left of the description.
pub fn generate_migration_name(description: &str, now: DateTime<Utc>) -> Result<String, MigrationError> {
    let clean: String = description
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    if clean.trim_matches('_').is_empty() {
        return Err(MigrationError::InvalidFormat(format!(
            "Description '{description}' has no letters or digits"
        )));
    }

    Ok(format!("{}_{clean}.sql", now.format("%Y%m%d%H%M%S")))
}

/// Create a new, commented migration file in `migrations_dir`
///
/// The directory is created if needed. Returns the new file's path.
///
/// # Errors
///
/// Returns an error for an unusable description, an existing file of the same
/// name, or a filesystem failure.
pub fn create_migration(migrations_dir: &Path, description: &str) -> Result<PathBuf, MigrationError> {
    let now = Utc::now();
    let filename = generate_migration_name(description, now)?;

    fs::create_dir_all(migrations_dir).map_err(|e| MigrationError::io(migrations_dir, e))?;

    let path = migrations_dir.join(&filename);
    let template = format!(
        "-- Migration: {description}\n\
         -- Created: {created}\n\
         \n\
         -- Write your migration SQL here. The whole file runs in one transaction.\n\
         \n\
         \n\
         -- Rollback SQL goes in {stem}{DOWN_SUFFIX} (see `lockstep new-down`).\n",
        created = now.to_rfc3339(),
        stem = filename.trim_end_matches(".sql"),
    );
    write_new(&path, &template)?;
    log::info!("Created migration {}", path.display());
    Ok(path)
}

/// Create the `.down.sql` companion for an existing migration
///
/// # Errors
///
/// Returns an error if the up migration does not exist, the companion already
/// exists, or the file cannot be written.
pub fn create_down_migration(migrations_dir: &Path, up_migration: &str) -> Result<PathBuf, MigrationError> {
    let up_path = migrations_dir.join(up_migration);
    if !up_path.is_file() {
        return Err(MigrationError::InvalidFormat(format!(
            "Up migration not found: {up_migration}"
        )));
    }

    let path = down_file_path(migrations_dir, up_migration);
    let template = format!(
        "-- Down migration for: {up_migration}\n\
         -- Created: {}\n\
         \n\
         -- Write SQL that reverses {up_migration}\n\
         \n",
        Utc::now().to_rfc3339()
    );
    write_new(&path, &template)?;
    log::info!("Created rollback {}", path.display());
    Ok(path)
}

fn write_new(path: &Path, contents: &str) -> Result<(), MigrationError> {
    if path.exists() {
        return Err(MigrationError::InvalidFormat(format!(
            "{} already exists",
            path.display()
        )));
    }
    fs::write(path, contents).map_err(|e| MigrationError::io(path, e))
}
