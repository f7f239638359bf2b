//! Migration sessions
//!
//! A session bounds one coordinator operation:
//!
//! ```text
//! Disconnected -> Connected -> Locked -> TableEnsured -> Reconciled -> Executing
//!     -> (success | failure) -> Unlocking -> Disconnected
//! ```
//!
//! Teardown runs on success and failure alike: the lock guard releases the
//! advisory lock, then the connection is closed. Nothing read inside a
//! session survives it; the next session reconciles from scratch.

use crate::executor::{Connector, MigrationExecutor};
use crate::migration::lock::{lock_key, LockGuard};
use crate::migration::reconcile::{reconcile, Reconciled};
use crate::migration::state_table::StateTable;
use crate::migration::{Catalog, MigrationError};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Run `operation` inside a locked, reconciled session against `connector`'s database
///
/// # Errors
///
/// Returns the first failure of connecting, locking, preparing the
/// bookkeeping table, reconciling, or `operation` itself.
pub fn with_session<C, T, F>(
    connector: &C,
    table: &StateTable,
    catalog: &Catalog,
    operation: F,
) -> Result<T, MigrationError>
where
    C: Connector,
    F: FnOnce(&C::Executor, &Reconciled<'_>) -> Result<T, MigrationError>,
{
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::session_span(table.name()).entered();

    log::info!("migrate: connecting...");
    let executor = connector.connect()?;

    let result = locked(&executor, lock_key(connector.identity()), table, catalog, operation);

    log::info!("migrate: closing connection...");
    if let Err(e) = executor.close() {
        log::warn!("migrate: unable to close connection: {}", e);
    }

    result
}

fn locked<E, T, F>(
    executor: &E,
    key: i64,
    table: &StateTable,
    catalog: &Catalog,
    operation: F,
) -> Result<T, MigrationError>
where
    E: MigrationExecutor,
    F: FnOnce(&E, &Reconciled<'_>) -> Result<T, MigrationError>,
{
    let _lock = LockGuard::acquire(executor, key)?;

    ensure_table(executor, table)?;

    // Ordering the catalog happens here, under the lock, on a borrowed view.
    let state = reconcile(executor, table, catalog)?;

    operation(executor, &state)
}

/// Create the bookkeeping table if it does not exist
///
/// Only safe against concurrent creators while the advisory lock is held.
///
/// # Errors
///
/// Returns `MigrationError::StateTable` if the check or the creation fails.
pub fn ensure_table<E: MigrationExecutor>(
    executor: &E,
    table: &StateTable,
) -> Result<(), MigrationError> {
    let exists = executor
        .table_exists(table)
        .map_err(MigrationError::StateTable)?;
    if !exists {
        log::info!(
            "migrate: {} table does not exist, creating...",
            table.name()
        );
        executor
            .create_table(table)
            .map_err(MigrationError::StateTable)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Migration;
    use crate::mock::{Fault, MemoryDatabase};

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog
            .register(Migration::new(
                1,
                "widgets_init",
                "create table widgets",
                "drop table widgets",
            ))
            .unwrap();
        catalog
    }

    #[test]
    fn test_session_creates_table_and_tears_down() {
        let db = MemoryDatabase::new("memory://session");
        let table = StateTable::default();
        let key = lock_key(db.identity());

        let seen = with_session(&db, &table, &catalog(), |_, state| {
            assert!(db.is_locked(key));
            assert_eq!(db.open_connections(), 1);
            Ok(state.ordered().len())
        })
        .unwrap();

        assert_eq!(seen, 1);
        assert_eq!(db.applied_versions(&table), Some(vec![]));
        assert!(!db.is_locked(key));
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn test_failed_operation_still_releases_lock_and_connection() {
        let db = MemoryDatabase::new("memory://session-fail");
        let table = StateTable::default();

        let err = with_session(&db, &table, &catalog(), |_, _| -> Result<(), MigrationError> {
            Err(MigrationError::MissingDefinition { version: 9 })
        })
        .unwrap_err();

        assert!(matches!(err, MigrationError::MissingDefinition { version: 9 }));
        assert!(!db.is_locked(lock_key(db.identity())));
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn test_connect_failure_aborts_before_anything_runs() {
        let db = MemoryDatabase::new("memory://session-connect");
        db.inject(Fault::Connect);

        let err = with_session(&db, &StateTable::default(), &catalog(), |_, _| Ok(()))
            .unwrap_err();

        assert!(matches!(err, MigrationError::Connection(_)));
        assert_eq!(db.applied_versions(&StateTable::default()), None);
    }

    #[test]
    fn test_unknown_version_fails_reconciliation() {
        let db = MemoryDatabase::new("memory://session-unknown");
        let table = StateTable::default();
        db.record_version(&table, 99);

        let mut ran = false;
        let err = with_session(&db, &table, &catalog(), |_, _| {
            ran = true;
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, MigrationError::MissingDefinition { version: 99 }));
        assert!(!ran);
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn test_ensure_table_is_idempotent() {
        let db = MemoryDatabase::new("memory://session-ensure");
        let conn = db.connect().unwrap();
        let table = StateTable::new("app_versions").unwrap();

        ensure_table(&conn, &table).unwrap();
        db.record_version(&table, 1);
        ensure_table(&conn, &table).unwrap();

        assert_eq!(db.applied_versions(&table), Some(vec![1]));
    }
}
