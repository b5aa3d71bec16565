//! PostgreSQL advisory-lock based migration locking
//!
//! Lock names are hashed to a stable 64-bit key ([`lock_id_for`]) so every
//! process derives the same key without a lookup table. Locks are taken with
//! `pg_try_advisory_lock` on the executor's own session: they are released
//! when the session ends, including when the process holding them dies.
//! There is deliberately no lease, heartbeat or lock row to clean up.

use crate::migration::MigrationError;
use crate::session::Session;
use sha2::{Digest, Sha256};
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Prefix of the per-project migration lock name
pub const MIGRATION_LOCK_PREFIX: &str = "lockstep_migrations_";

/// Default bound on lock acquisition, in seconds
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

/// Convert a lock name to a PostgreSQL advisory lock key
///
/// The first 8 bytes of the SHA-256 digest of `name`, read as a signed
/// big-endian integer.
#[must_use]
pub fn lock_id_for(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Name of the migration lock for a project
#[must_use]
pub fn migration_lock_name(project_name: &str) -> String {
    format!("{MIGRATION_LOCK_PREFIX}{project_name}")
}

/// One named advisory lock on one session
pub struct AdvisoryLock<'a> {
    session: &'a dyn Session,
    name: String,
    lock_id: i64,
    held: bool,
}

impl<'a> AdvisoryLock<'a> {
    #[must_use]
    pub fn new(session: &'a dyn Session, name: impl Into<String>) -> Self {
        let name = name.into();
        let lock_id = lock_id_for(&name);
        Self {
            session,
            name,
            lock_id,
            held: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// Whether this manager currently holds the lock
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Try to take the lock without waiting for other holders
    ///
    /// Returns `Ok(true)` if the lock is now held by this manager (including
    /// when it already was) and `Ok(false)` if another session holds it.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the database call itself fails.
    pub fn acquire(&mut self, timeout: Duration) -> Result<bool, MigrationError> {
        if self.held {
            return Ok(true);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(&self.name, self.lock_id).entered();

        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let acquired = self
            .session
            .try_advisory_lock(self.lock_id, timeout)
            .map_err(|e| MigrationError::Lock(format!("Failed to acquire lock '{}': {e}", self.name)))?;

        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_lock_wait(started.elapsed(), acquired);

        self.held = acquired;
        if acquired {
            log::debug!("Acquired advisory lock '{}' ({})", self.name, self.lock_id);
        } else {
            #[cfg(feature = "metrics")]
            crate::metrics::METRICS.record_lock_contention();
            log::debug!("Advisory lock '{}' is held by another session", self.name);
        }
        Ok(acquired)
    }

    /// Release the lock
    ///
    /// A no-op when this manager does not hold it.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the unlock call fails or PostgreSQL
    /// reports that this session did not hold the lock.
    pub fn release(&mut self) -> Result<(), MigrationError> {
        if !self.held {
            return Ok(());
        }

        let released = self
            .session
            .advisory_unlock(self.lock_id)
            .map_err(|e| MigrationError::Lock(format!("Failed to release lock '{}': {e}", self.name)))?;

        // Either way this session no longer holds it.
        self.held = false;

        if released {
            log::debug!("Released advisory lock '{}'", self.name);
            Ok(())
        } else {
            Err(MigrationError::Lock(format!(
                "Failed to release lock '{}': not held by this session",
                self.name
            )))
        }
    }

    /// Whether any session currently holds the lock
    ///
    /// Diagnostic only: the answer can be stale by the time it is read.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the lock catalog cannot be read.
    pub fn is_locked(&self) -> Result<bool, MigrationError> {
        let holders = self
            .session
            .advisory_lock_holders(self.lock_id)
            .map_err(|e| MigrationError::Lock(format!("Failed to inspect lock '{}': {e}", self.name)))?;
        Ok(holders > 0)
    }
}

/// Lock guard that releases the lock when dropped
///
/// Prefer [`LockGuard::release`] on the normal path so release failures are
/// reported; the `Drop` impl covers early returns and panics.
pub struct LockGuard<'a> {
    lock: AdvisoryLock<'a>,
}

impl<'a> LockGuard<'a> {
    /// Acquire `name` on `session`, failing if another session holds it
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockUnavailable` if the lock is held elsewhere
    /// and `MigrationError::Lock` if the database call fails.
    pub fn acquire(
        session: &'a dyn Session,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, MigrationError> {
        let mut lock = AdvisoryLock::new(session, name);
        if !lock.acquire(timeout)? {
            return Err(MigrationError::LockUnavailable {
                lock_name: lock.name().to_string(),
            });
        }
        Ok(Self { lock })
    }

    #[must_use]
    pub fn lock(&self) -> &AdvisoryLock<'a> {
        &self.lock
    }

    /// Release the lock now, reporting failures
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the unlock is rejected.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.lock.release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            log::warn!("{e}");
        }
    }
}

/// Take the per-project migration lock
///
/// # Errors
///
/// See [`LockGuard::acquire`].
pub fn migration_lock<'a>(
    session: &'a dyn Session,
    project_name: &str,
    timeout: Duration,
) -> Result<LockGuard<'a>, MigrationError> {
    LockGuard::acquire(session, migration_lock_name(project_name), timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connector;
    use crate::testing::MemoryDatabase;
    use std::collections::HashSet;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_lock_id_is_deterministic() {
        assert_eq!(lock_id_for("lockstep_migrations_app"), lock_id_for("lockstep_migrations_app"));
        assert_ne!(lock_id_for("lockstep_migrations_app"), lock_id_for("lockstep_migrations_api"));
    }

    #[test]
    fn test_lock_id_matches_digest_prefix() {
        let digest = Sha256::digest(b"abc");
        let expected = i64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        assert_eq!(lock_id_for("abc"), expected);
        // sha256("abc") starts with 0xba, so the key is negative
        assert!(lock_id_for("abc") < 0);
    }

    #[test]
    fn test_lock_ids_do_not_collide_over_sample() {
        let ids: HashSet<i64> = (0..50_000)
            .map(|i| lock_id_for(&format!("lockstep_migrations_project_{i}")))
            .collect();
        assert_eq!(ids.len(), 50_000);
    }

    #[test]
    fn test_migration_lock_name() {
        assert_eq!(migration_lock_name("billing"), "lockstep_migrations_billing");
    }

    #[test]
    fn test_acquire_release_cycle() {
        let db = MemoryDatabase::new();
        let session = db.open("memory://").unwrap();
        let mut lock = AdvisoryLock::new(session.as_ref(), "l");

        assert!(!lock.is_locked().unwrap());
        assert!(lock.acquire(TIMEOUT).unwrap());
        assert!(lock.is_held());
        assert!(lock.is_locked().unwrap());
        // Re-acquiring while held is a no-op success
        assert!(lock.acquire(TIMEOUT).unwrap());

        lock.release().unwrap();
        assert!(!lock.is_held());
        assert!(!lock.is_locked().unwrap());
        // Releasing again is a no-op
        lock.release().unwrap();
    }

    #[test]
    fn test_second_session_cannot_acquire() {
        let db = MemoryDatabase::new();
        let first = db.open("memory://").unwrap();
        let second = db.open("memory://").unwrap();

        let mut a = AdvisoryLock::new(first.as_ref(), "shared");
        let mut b = AdvisoryLock::new(second.as_ref(), "shared");

        assert!(a.acquire(TIMEOUT).unwrap());
        assert!(!b.acquire(TIMEOUT).unwrap());
        assert!(b.is_locked().unwrap());

        a.release().unwrap();
        assert!(b.acquire(TIMEOUT).unwrap());
    }

    #[test]
    fn test_session_end_releases_lock() {
        let db = MemoryDatabase::new();
        let survivor = db.open("memory://").unwrap();
        {
            let doomed = db.open("memory://").unwrap();
            let mut lock = AdvisoryLock::new(doomed.as_ref(), "crash");
            assert!(lock.acquire(TIMEOUT).unwrap());
            // Simulate the holder going away without releasing
            std::mem::forget(lock);
        }
        let mut lock = AdvisoryLock::new(survivor.as_ref(), "crash");
        assert!(lock.acquire(TIMEOUT).unwrap());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let db = MemoryDatabase::new();
        let session = db.open("memory://").unwrap();
        let other = db.open("memory://").unwrap();
        {
            let _guard = migration_lock(session.as_ref(), "app", TIMEOUT).unwrap();
            let err = migration_lock(other.as_ref(), "app", TIMEOUT).err().unwrap();
            assert!(matches!(err, MigrationError::LockUnavailable { .. }));
        }
        let guard = migration_lock(other.as_ref(), "app", TIMEOUT).unwrap();
        guard.release().unwrap();
    }

    #[test]
    fn test_acquire_surfaces_connection_failure() {
        let db = MemoryDatabase::new();
        let session = db.open("memory://").unwrap();
        db.fail_lock_calls(true);

        let mut lock = AdvisoryLock::new(session.as_ref(), "broken");
        let err = lock.acquire(TIMEOUT).unwrap_err();
        assert!(matches!(err, MigrationError::Lock(_)));
        assert!(!lock.is_held());
    }

    #[test]
    fn test_release_rejected_by_database() {
        let db = MemoryDatabase::new();
        let session = db.open("memory://").unwrap();
        let mut lock = AdvisoryLock::new(session.as_ref(), "stolen");
        assert!(lock.acquire(TIMEOUT).unwrap());

        // The server forgets the lock (e.g. pg_advisory_unlock_all from elsewhere in the session)
        db.forget_locks();

        let err = lock.release().unwrap_err();
        assert!(err.to_string().contains("not held by this session"));
        assert!(!lock.is_held());
    }
}
