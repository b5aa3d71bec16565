//! Checksum calculation for migration files

use crate::migration::MigrationError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Calculate the SHA-256 checksum of a migration file
///
/// The hash covers the raw bytes, so the result is identical across calls,
/// processes and platforms for identical content.
///
/// # Returns
///
/// Returns the lowercase hexadecimal SHA-256 hash of the file content
///
/// # Errors
///
/// Returns `MigrationError::Io` if the file cannot be read
pub fn compute_checksum(migration_file_path: &Path) -> Result<String, MigrationError> {
    let content = fs::read(migration_file_path)
        .map_err(|e| MigrationError::io(migration_file_path, e))?;
    Ok(checksum_bytes(&content))
}

/// SHA-256 of an in-memory body, hex encoded
#[must_use]
pub fn checksum_bytes(content: &[u8]) -> String {
    let hash = Sha256::digest(content);
    format!("{hash:x}")
}

/// Validate a recorded checksum against the current one
///
/// # Errors
///
/// Returns `MigrationError::ChecksumMismatch` if they differ
pub fn validate_checksum(name: &str, recorded: &str, current: &str) -> Result<(), MigrationError> {
    if recorded == current {
        Ok(())
    } else {
        Err(MigrationError::ChecksumMismatch {
            name: name.to_string(),
            recorded: recorded.to_string(),
            current: current.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20240101000000_initial.sql");
        fs::write(&path, "CREATE TABLE users (id SERIAL PRIMARY KEY);").unwrap();

        let first = compute_checksum(&path).unwrap();
        let second = compute_checksum(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_eq!(first, checksum_bytes(b"CREATE TABLE users (id SERIAL PRIMARY KEY);"));
    }

    #[test]
    fn test_checksum_known_value() {
        // sha256("") is a fixed constant
        assert_eq!(
            checksum_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checksum_changes_with_content() {
        assert_ne!(checksum_bytes(b"SELECT 1;"), checksum_bytes(b"SELECT 1; "));
    }

    #[test]
    fn test_checksum_missing_file() {
        let err = compute_checksum(Path::new("/definitely/not/here.sql")).unwrap_err();
        assert!(matches!(err, MigrationError::Io { .. }));
    }

    #[test]
    fn test_validate_checksum() {
        assert!(validate_checksum("a.sql", "x", "x").is_ok());
        assert!(matches!(
            validate_checksum("a.sql", "x", "y"),
            Err(MigrationError::ChecksumMismatch { .. })
        ));
    }
}
