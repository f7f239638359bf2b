//! Bookkeeping table management
//!
//! The bookkeeping table holds one row per applied migration:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS "schema_migrations" ("version" bigint NOT NULL PRIMARY KEY)
//! ```
//!
//! A row exists exactly when that version's forward script has committed and
//! its backward script has not since committed. Rows are only written inside
//! the same transaction as the script they describe.

use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use sea_query::{Alias, ColumnDef, PostgresQueryBuilder, Table};

/// Table name used when none is configured
pub const DEFAULT_TABLE: &str = "schema_migrations";

// Unquoted PostgreSQL identifier, at most 63 bytes
static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("table name pattern is valid")
});

/// Name of the bookkeeping table plus the SQL that touches it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTable {
    name: String,
}

impl StateTable {
    /// Existence check, scoped to the session's current schema. Binds the table name as `$1`.
    pub const EXISTS_SQL: &'static str = "SELECT EXISTS (\
        SELECT 1 FROM information_schema.tables \
        WHERE table_schema = current_schema() AND table_name = $1)";

    /// Use `name` as the bookkeeping table
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidTableName` unless `name` is a plain
    /// identifier (letters, digits, underscores, not starting with a digit,
    /// at most 63 characters).
    pub fn new(name: impl Into<String>) -> Result<Self, MigrationError> {
        let name = name.into();
        if !TABLE_NAME.is_match(&name) {
            return Err(MigrationError::InvalidTableName(name));
        }
        Ok(Self { name })
    }

    /// The unquoted table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `CREATE TABLE IF NOT EXISTS` for the bookkeeping table
    pub fn create_sql(&self) -> String {
        Table::create()
            .table(Alias::new(self.name.as_str()))
            .if_not_exists()
            .col(
                ColumnDef::new(Alias::new("version"))
                    .big_integer()
                    .not_null()
                    .primary_key(),
            )
            .build(PostgresQueryBuilder)
    }

    /// All recorded versions, ascending
    pub fn select_versions_sql(&self) -> String {
        format!("SELECT version FROM {} ORDER BY version ASC", self.quoted())
    }

    /// Record a version. Binds the version as `$1`.
    pub fn insert_sql(&self) -> String {
        format!("INSERT INTO {} (version) VALUES ($1)", self.quoted())
    }

    /// Remove a version. Binds the version as `$1`.
    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE version = $1", self.quoted())
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.name)
    }
}

impl Default for StateTable {
    fn default() -> Self {
        Self {
            name: DEFAULT_TABLE.to_string(),
        }
    }
}
