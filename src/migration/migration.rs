//! Migration definition

use std::fmt;

/// One versioned schema change: a forward script and the backward script that undoes it
///
/// Versions define the total order migrations run in and must be unique
/// within a [`Migrator`](crate::migration::Migrator). Both scripts are opaque
/// text executed verbatim and may contain several statements.
///
/// # Example
///
/// ```rust
/// use lockstep::migration::Migration;
///
/// let migration = Migration::new(
///     1,
///     "widgets_init",
///     "create table widgets (widget_id integer primary key, name text);",
///     "drop table if exists widgets;",
/// );
/// assert_eq!(migration.to_string(), "\"1: widgets_init\"");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    version: i64,
    name: String,
    up: String,
    down: String,
}

impl Migration {
    /// Create a new migration
    pub fn new(
        version: i64,
        name: impl Into<String>,
        up: impl Into<String>,
        down: impl Into<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            up: up.into(),
            down: down.into(),
        }
    }

    /// Get the migration version
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Get the migration name (human-readable identifier)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward script
    pub fn up(&self) -> &str {
        &self.up
    }

    /// Backward script
    pub fn down(&self) -> &str {
        &self.down
    }

    /// The script that moves the schema in `direction`
    pub fn script(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}: {}\"", self.version, self.name)
    }
}

/// Which way a migration run moves the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Apply pending migrations, lowest version first
    Up,
    /// Revert applied migrations, highest version first
    Down,
}

impl Direction {
    /// Lowercase name used in log lines and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    pub(crate) fn progressive(self) -> &'static str {
        match self {
            Direction::Up => "applying",
            Direction::Down => "reverting",
        }
    }

    pub(crate) fn past(self) -> &'static str {
        match self {
            Direction::Up => "applied",
            Direction::Down => "reverted",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
