//! Advisory-lock based mutual exclusion between migration sessions
//!
//! Every session targeting the same database takes the same advisory lock
//! before it reads or writes migration state. The key is derived from the
//! connector's identity, so coordinators in different processes agree on it
//! without sharing anything but the connection string, and different
//! databases never contend.
//!
//! The lock is session-scoped: closing the connection frees it even if the
//! explicit release fails.

use crate::executor::MigrationExecutor;
use crate::migration::MigrationError;
use sha2::{Digest, Sha256};
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Holds the advisory lock until dropped
///
/// Releases on every exit path, including early returns and panics.
pub struct LockGuard<'a, E: MigrationExecutor> {
    executor: &'a E,
    key: i64,
}

impl<'a, E: MigrationExecutor> LockGuard<'a, E> {
    /// Acquire the lock `key` on `executor` and create the guard
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the lock cannot be acquired.
    pub fn acquire(executor: &'a E, key: i64) -> Result<Self, MigrationError> {
        acquire(executor, key)?;
        Ok(Self { executor, key })
    }

    /// The lock key held
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl<E: MigrationExecutor> Drop for LockGuard<'_, E> {
    fn drop(&mut self) {
        release(self.executor, self.key);
    }
}

/// Derive the advisory lock key for a database identity
///
/// The first eight bytes of the SHA-256 digest, big-endian, as a signed
/// 64-bit key (`pg_advisory_lock(bigint)`).
pub fn lock_key(identity: &str) -> i64 {
    let digest = Sha256::digest(identity.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Block until the advisory lock `key` is held by `executor`
///
/// # Errors
///
/// Returns `MigrationError::Lock` if the lock call fails. There is no
/// timeout: a caller that needs one must cut the connection externally.
pub fn acquire<E: MigrationExecutor>(executor: &E, key: i64) -> Result<(), MigrationError> {
    let start = Instant::now();
    log::info!("migrate: obtaining lock...");
    log::debug!("migrate: lock key {}", key);

    executor
        .advisory_lock(key)
        .map_err(|source| MigrationError::Lock { key, source })?;

    let waited = start.elapsed();
    #[cfg(feature = "metrics")]
    METRICS.record_lock_wait(waited);

    log::info!("migrate: obtained lock in {:?}", waited);
    Ok(())
}

/// Release the advisory lock `key`
///
/// Failures are logged, never returned: closing the connection frees the
/// lock regardless.
pub fn release<E: MigrationExecutor>(executor: &E, key: i64) {
    log::info!("migrate: releasing lock...");
    if let Err(e) = executor.advisory_unlock(key) {
        log::warn!("migrate: unable to release lock: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Fault, MemoryDatabase};
    use crate::Connector;

    #[test]
    fn test_lock_key_is_stable() {
        let url = "postgres://postgres:@127.0.0.1:5432/app?sslmode=disable";
        assert_eq!(lock_key(url), lock_key(url));
        assert_eq!(lock_key(url), lock_key(&url.to_string()));
    }

    #[test]
    fn test_lock_key_differs_between_databases() {
        let a = lock_key("postgres://postgres@localhost:5432/app_a");
        let b = lock_key("postgres://postgres@localhost:5432/app_b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_acquire_and_release() {
        let db = MemoryDatabase::new("memory://lock");
        let conn = db.connect().unwrap();
        let key = lock_key(db.identity());

        acquire(&conn, key).unwrap();
        assert!(db.is_locked(key));

        release(&conn, key);
        assert!(!db.is_locked(key));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let db = MemoryDatabase::new("memory://lock-guard");
        let conn = db.connect().unwrap();
        let key = lock_key(db.identity());

        {
            let guard = LockGuard::acquire(&conn, key).unwrap();
            assert_eq!(guard.key(), key);
            assert!(db.is_locked(key));
        }
        assert!(!db.is_locked(key));
    }

    #[test]
    fn test_release_failure_is_swallowed() {
        let db = MemoryDatabase::new("memory://lock-release");
        let conn = db.connect().unwrap();
        let key = lock_key(db.identity());

        acquire(&conn, key).unwrap();
        db.inject(Fault::Unlock);
        release(&conn, key);
        assert!(db.is_locked(key));

        // Closing the connection frees a session-scoped lock
        drop(conn);
        assert!(!db.is_locked(key));
    }

    #[test]
    fn test_acquire_failure_maps_to_lock_error() {
        let db = MemoryDatabase::new("memory://lock-fail");
        let conn = db.connect().unwrap();
        db.inject(Fault::Lock);

        let err = acquire(&conn, 7).unwrap_err();
        assert!(matches!(err, MigrationError::Lock { key: 7, .. }));
    }
}
