//! Reconciliation of the catalog against the bookkeeping table
//!
//! Runs once per session, while the session holds the advisory lock. The
//! result is a fresh overlay: a version-ordered view of the catalog plus the
//! set of applied versions. Nothing in the catalog itself is mutated.

use crate::executor::MigrationExecutor;
use crate::migration::state_table::StateTable;
use crate::migration::{Catalog, Direction, Migration, MigrationError};
use std::collections::BTreeSet;

/// Applied state of every catalog entry for one session
#[derive(Debug)]
pub struct Reconciled<'a> {
    ordered: Vec<&'a Migration>,
    applied: BTreeSet<i64>,
}

impl<'a> Reconciled<'a> {
    /// Cross-reference recorded `versions` against `catalog`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::MissingDefinition` for the first recorded
    /// version (in the order given) with no catalog entry.
    pub fn new(catalog: &'a Catalog, versions: &[i64]) -> Result<Self, MigrationError> {
        let mut applied = BTreeSet::new();
        for &version in versions {
            if catalog.get(version).is_none() {
                return Err(MigrationError::MissingDefinition { version });
            }
            applied.insert(version);
        }

        let mut ordered: Vec<&Migration> = catalog.iter().collect();
        ordered.sort_by_key(|m| m.version());

        Ok(Self { ordered, applied })
    }

    /// Whether `version` is recorded as applied in this session
    pub fn is_applied(&self, version: i64) -> bool {
        self.applied.contains(&version)
    }

    /// Every catalog entry, ascending by version
    pub fn ordered(&self) -> &[&'a Migration] {
        &self.ordered
    }

    /// Migrations waiting to run in `direction`, in the order they must run
    ///
    /// `Up`: unapplied, ascending. `Down`: applied, descending.
    pub fn pending(&self, direction: Direction) -> Vec<&'a Migration> {
        match direction {
            Direction::Up => self
                .ordered
                .iter()
                .copied()
                .filter(|m| !self.is_applied(m.version()))
                .collect(),
            Direction::Down => self
                .ordered
                .iter()
                .rev()
                .copied()
                .filter(|m| self.is_applied(m.version()))
                .collect(),
        }
    }
}

/// Read the bookkeeping table and reconcile it against `catalog`
///
/// # Errors
///
/// Returns `MigrationError::StateTable` if the table cannot be read and
/// `MigrationError::MissingDefinition` if it records an unknown version.
pub fn reconcile<'a, E: MigrationExecutor>(
    executor: &E,
    table: &StateTable,
    catalog: &'a Catalog,
) -> Result<Reconciled<'a>, MigrationError> {
    let versions = executor
        .applied_versions(table)
        .map_err(MigrationError::StateTable)?;
    log::debug!("migrate: recorded versions {:?}", versions);
    Reconciled::new(catalog, &versions)
}
