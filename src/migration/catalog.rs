//! Catalog of registered migrations

use crate::migration::{Migration, MigrationError};

/// The migrations a [`Migrator`](crate::migration::Migrator) knows about, in registration order
///
/// The catalog is never reordered. Sessions sort a borrowed view of it
/// instead (see [`reconcile`](crate::migration::reconcile)).
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    migrations: Vec<Migration>,
}

impl Catalog {
    /// An empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateVersion` if a migration with the same
    /// version is already registered.
    pub fn register(&mut self, migration: Migration) -> Result<(), MigrationError> {
        if self.get(migration.version()).is_some() {
            return Err(MigrationError::DuplicateVersion {
                version: migration.version(),
                name: migration.name().to_string(),
            });
        }
        self.migrations.push(migration);
        Ok(())
    }

    /// Look up a migration by version
    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.version() == version)
    }

    /// Migrations in registration order
    pub fn iter(&self) -> std::slice::Iter<'_, Migration> {
        self.migrations.iter()
    }

    /// Number of registered migrations
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether nothing is registered yet
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a Migration;
    type IntoIter = std::slice::Iter<'a, Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_keeps_registration_order() {
        let mut catalog = Catalog::new();
        catalog.register(Migration::new(2, "b", "", "")).unwrap();
        catalog.register(Migration::new(1, "a", "", "")).unwrap();

        let versions: Vec<i64> = catalog.iter().map(Migration::version).collect();
        assert_eq!(versions, vec![2, 1]);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(1).map(Migration::name), Some("a"));
        assert!(catalog.get(3).is_none());
    }

    #[test]
    fn test_register_rejects_duplicate_version() {
        let mut catalog = Catalog::new();
        catalog.register(Migration::new(1, "widgets_init", "", "")).unwrap();

        let err = catalog
            .register(Migration::new(1, "widgets_again", "", ""))
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::DuplicateVersion { version: 1, ref name } if name == "widgets_again"
        ));
        assert_eq!(catalog.len(), 1);
    }
}
