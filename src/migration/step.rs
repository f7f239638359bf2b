//! Migration execution
//!
//! Runs pending migrations one transaction at a time. Each transaction holds
//! the migration's script and its bookkeeping write, so the table can never
//! disagree with the schema. The first failure stops the run; migrations
//! committed before it stay committed.

use crate::executor::MigrationExecutor;
use crate::migration::reconcile::Reconciled;
use crate::migration::state_table::StateTable;
use crate::migration::{Direction, Migration, MigrationError};
use crate::transaction::Transaction;
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Run up to `limit` pending migrations in `direction` (`None` = all of them)
///
/// Returns how many ran. Running out of pending migrations before `limit`
/// is reached is not an error.
///
/// # Errors
///
/// Returns the failure of the first migration that does not commit.
pub fn run_pending<E: MigrationExecutor>(
    executor: &E,
    table: &StateTable,
    state: &Reconciled<'_>,
    direction: Direction,
    limit: Option<usize>,
) -> Result<usize, MigrationError> {
    let pending = state.pending(direction);
    match direction {
        Direction::Up => log::info!(
            "migrate up: there are {} pending migrations.",
            pending.len()
        ),
        Direction::Down => log::info!(
            "migrate down: there are {} applied migrations.",
            pending.len()
        ),
    }

    let batch = pending.into_iter().take(limit.unwrap_or(usize::MAX));

    let mut count = 0;
    for migration in batch {
        run_one(executor, table, migration, direction)?;
        count += 1;
    }
    Ok(count)
}

/// Run one migration's script and bookkeeping write in a single transaction
///
/// # Errors
///
/// - `TransactionFailed` if the transaction cannot begin or commit
/// - `ScriptFailed` if the script fails
/// - `BookkeepingFailed` if recording the result fails
///
/// The transaction is rolled back in every error case.
pub fn run_one<E: MigrationExecutor>(
    executor: &E,
    table: &StateTable,
    migration: &Migration,
    direction: Direction,
) -> Result<(), MigrationError> {
    #[cfg(feature = "tracing")]
    let _span =
        tracing_helpers::migration_span(migration.version(), migration.name(), direction.as_str())
            .entered();

    let start = Instant::now();
    log::info!(
        "migrate {}: {} {}...",
        direction,
        direction.progressive(),
        migration
    );

    let result = transact(executor, table, migration, direction);

    let elapsed = start.elapsed();
    #[cfg(feature = "metrics")]
    METRICS.record_migration(direction, elapsed, result.is_ok());

    match &result {
        Ok(()) => log::info!(
            "migrate {}: successfully {} {} in {:?}.",
            direction,
            direction.past(),
            migration,
            elapsed
        ),
        Err(e) => {
            log::error!(
                "migrate {}: fatal error {} {}: {}",
                direction,
                direction.progressive(),
                migration,
                e
            );
            if matches!(e, MigrationError::ScriptFailed { .. }) {
                log::error!("source: {}", migration.script(direction));
            }
        }
    }

    result
}

fn transact<E: MigrationExecutor>(
    executor: &E,
    table: &StateTable,
    migration: &Migration,
    direction: Direction,
) -> Result<(), MigrationError> {
    let version = migration.version();
    let name = || migration.name().to_string();

    let tx = Transaction::begin(executor).map_err(|source| MigrationError::TransactionFailed {
        version,
        name: name(),
        direction,
        source,
    })?;

    if let Err(source) = tx.executor().batch_execute(migration.script(direction)) {
        rollback(tx);
        return Err(MigrationError::ScriptFailed {
            version,
            name: name(),
            direction,
            source,
        });
    }

    let recorded = match direction {
        Direction::Up => tx.executor().insert_version(table, version),
        Direction::Down => tx.executor().delete_version(table, version),
    };
    if let Err(source) = recorded {
        rollback(tx);
        return Err(MigrationError::BookkeepingFailed {
            version,
            name: name(),
            direction,
            source,
        });
    }

    // A failed commit leaves `tx` open; dropping it rolls back.
    tx.commit().map_err(|source| MigrationError::TransactionFailed {
        version,
        name: name(),
        direction,
        source,
    })
}

fn rollback<E: MigrationExecutor>(tx: Transaction<'_, E>) {
    if let Err(e) = tx.rollback() {
        log::warn!("migrate: rollback failed: {}", e);
    }
}
