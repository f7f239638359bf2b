//! Migration status reporting

use crate::migration::reconcile::Reconciled;

/// Applied state of every registered migration, as read in one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Every registered migration, ascending by version
    pub migrations: Vec<MigrationState>,

    /// Number of applied migrations
    pub applied_count: usize,

    /// Number of pending migrations
    pub pending_count: usize,

    /// Total number of registered migrations
    pub total: usize,
}

/// One registered migration and whether it is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationState {
    pub version: i64,
    pub name: String,
    pub applied: bool,
}

impl MigrationStatus {
    /// Snapshot a reconciled session
    #[must_use]
    pub fn from_reconciled(state: &Reconciled<'_>) -> Self {
        let migrations: Vec<MigrationState> = state
            .ordered()
            .iter()
            .map(|m| MigrationState {
                version: m.version(),
                name: m.name().to_string(),
                applied: state.is_applied(m.version()),
            })
            .collect();

        let applied_count = migrations.iter().filter(|m| m.applied).count();
        let total = migrations.len();

        Self {
            migrations,
            applied_count,
            pending_count: total - applied_count,
            total,
        }
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    /// Get the latest applied migration version
    #[must_use]
    pub fn latest_applied_version(&self) -> Option<i64> {
        self.migrations
            .iter()
            .filter(|m| m.applied)
            .map(|m| m.version)
            .max()
    }

    /// Get the version `apply_one` would run next
    #[must_use]
    pub fn next_pending_version(&self) -> Option<i64> {
        self.migrations
            .iter()
            .find(|m| !m.applied)
            .map(|m| m.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{Catalog, Migration};

    #[test]
    fn test_status_from_reconciled() {
        let mut catalog = Catalog::new();
        for (version, name) in [(3, "c"), (1, "a"), (2, "b")] {
            catalog.register(Migration::new(version, name, "", "")).unwrap();
        }
        let state = Reconciled::new(&catalog, &[1, 3]).unwrap();

        let status = MigrationStatus::from_reconciled(&state);

        let versions: Vec<i64> = status.migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(status.applied_count, 2);
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.total, 3);
        assert!(!status.is_up_to_date());
        assert_eq!(status.latest_applied_version(), Some(3));
        assert_eq!(status.next_pending_version(), Some(2));
    }

    #[test]
    fn test_empty_status_is_up_to_date() {
        let catalog = Catalog::new();
        let state = Reconciled::new(&catalog, &[]).unwrap();

        let status = MigrationStatus::from_reconciled(&state);
        assert!(status.is_up_to_date());
        assert_eq!(status.latest_applied_version(), None);
        assert_eq!(status.next_pending_version(), None);
    }
}
