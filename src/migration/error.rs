//! Migration-specific error types

use crate::connection::ConnectionError;
use crate::executor::DbError;
use crate::migration::Direction;

/// Migration-specific errors
///
/// Every failure ends the invocation that raised it. Migrations committed
/// earlier in the same run stay committed.
#[derive(Debug)]
pub enum MigrationError {
    /// The target database could not be reached
    Connection(ConnectionError),
    /// The advisory lock could not be acquired
    Lock { key: i64, source: DbError },
    /// The bookkeeping table could not be created or read
    StateTable(DbError),
    /// The bookkeeping table records a version no registered migration has
    MissingDefinition { version: i64 },
    /// Two migrations were registered with the same version
    DuplicateVersion { version: i64, name: String },
    /// A forward or backward script failed; its transaction was rolled back
    ScriptFailed {
        version: i64,
        name: String,
        direction: Direction,
        source: DbError,
    },
    /// The bookkeeping write after a successful script failed; the
    /// transaction was rolled back
    BookkeepingFailed {
        version: i64,
        name: String,
        direction: Direction,
        source: DbError,
    },
    /// The migration's transaction could not be opened or committed
    TransactionFailed {
        version: i64,
        name: String,
        direction: Direction,
        source: DbError,
    },
    /// The configured bookkeeping table name is not a plain identifier
    InvalidTableName(String),
    /// Configuration could not be loaded
    Config(config::ConfigError),
}

impl MigrationError {
    /// Version of the migration the error is about, if any
    pub fn version(&self) -> Option<i64> {
        match self {
            MigrationError::MissingDefinition { version }
            | MigrationError::DuplicateVersion { version, .. }
            | MigrationError::ScriptFailed { version, .. }
            | MigrationError::BookkeepingFailed { version, .. }
            | MigrationError::TransactionFailed { version, .. } => Some(*version),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Connection(e) => write!(f, "Unable to connect: {}", e),
            MigrationError::Lock { key, source } => {
                write!(f, "Unable to obtain migration lock {}: {}", key, source)
            }
            MigrationError::StateTable(e) => {
                write!(f, "Unable to prepare bookkeeping table: {}", e)
            }
            MigrationError::MissingDefinition { version } => {
                write!(
                    f,
                    "Unable to find migration for recorded version {}.\n\
                     The database has history this build does not know about; \
                     register the migration or restore the code that defines it.",
                    version
                )
            }
            MigrationError::DuplicateVersion { version, name } => {
                write!(
                    f,
                    "Migration '{}' reuses version {}, which is already registered",
                    name, version
                )
            }
            MigrationError::ScriptFailed {
                version,
                name,
                direction,
                source,
            } => write!(
                f,
                "Migration '{}' (version {}) failed running its {} script: {}",
                name, version, direction, source
            ),
            MigrationError::BookkeepingFailed {
                version,
                name,
                direction,
                source,
            } => write!(
                f,
                "Migration '{}' (version {}) ran its {} script but the bookkeeping write failed: {}",
                name, version, direction, source
            ),
            MigrationError::TransactionFailed {
                version,
                name,
                direction,
                source,
            } => write!(
                f,
                "Migration '{}' (version {}) could not complete its {} transaction: {}",
                name, version, direction, source
            ),
            MigrationError::InvalidTableName(name) => {
                write!(f, "Invalid bookkeeping table name: {:?}", name)
            }
            MigrationError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Connection(e) => Some(e),
            MigrationError::Lock { source, .. }
            | MigrationError::ScriptFailed { source, .. }
            | MigrationError::BookkeepingFailed { source, .. }
            | MigrationError::TransactionFailed { source, .. } => Some(source),
            MigrationError::StateTable(e) => Some(e),
            MigrationError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for MigrationError {
    fn from(error: ConnectionError) -> Self {
        MigrationError::Connection(error)
    }
}

impl From<config::ConfigError> for MigrationError {
    fn from(error: config::ConfigError) -> Self {
        MigrationError::Config(error)
    }
}
