//! Throw-away PostgreSQL databases for integration tests
//!
//! [`TestDatabase::new`] reads `TEST_DATABASE_URL`, creates a fresh database
//! with a random name on that server, and drops it again when the
//! `TestDatabase` goes out of scope. Tests never share schema state, and the
//! advisory lock key (derived from the URL) is unique per test.

use crate::connection::{connect, ConnectionError};
use crate::executor::{Connector, PgConnector, PgExecutor};
use uuid::Uuid;

/// Environment variable naming the server to create test databases on
pub const TEST_DATABASE_URL: &str = "TEST_DATABASE_URL";

/// A database that exists for the lifetime of this value
pub struct TestDatabase {
    admin_url: String,
    name: String,
    connector: PgConnector,
}

impl TestDatabase {
    /// Whether `TEST_DATABASE_URL` is set
    pub fn available() -> bool {
        std::env::var(TEST_DATABASE_URL).is_ok()
    }

    /// Create a fresh database on the `TEST_DATABASE_URL` server
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the variable is unset or not a URI, or if
    /// the server refuses the connection or the `CREATE DATABASE`.
    pub fn new() -> Result<Self, ConnectionError> {
        let admin_url = std::env::var(TEST_DATABASE_URL)
            .map_err(|_| ConnectionError::Other(format!("{TEST_DATABASE_URL} is not set")))?;
        let name = format!("lockstep_test_{}", Uuid::new_v4().simple());
        let url = with_database(&admin_url, &name).ok_or_else(|| {
            ConnectionError::InvalidConnectionString(format!(
                "{TEST_DATABASE_URL} must be a postgresql:// URI"
            ))
        })?;

        let admin = connect(&admin_url)?;
        admin.batch_execute(&format!("CREATE DATABASE \"{name}\""))?;
        log::debug!("test database {} created", name);

        Ok(Self {
            admin_url,
            name,
            connector: PgConnector::new(url)?,
        })
    }

    /// Connection string of the test database
    pub fn url(&self) -> &str {
        self.connector.url()
    }

    /// Name of the throw-away database
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connector for the test database
    pub fn connector(&self) -> PgConnector {
        self.connector.clone()
    }

    /// A new connection to the test database, for assertions
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the connection fails.
    pub fn executor(&self) -> Result<PgExecutor, ConnectionError> {
        self.connector.connect()
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let dropped = connect(&self.admin_url).and_then(|admin| {
            admin
                .batch_execute(&format!(
                    "DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)",
                    self.name
                ))
                .map_err(ConnectionError::from)
        });
        if let Err(e) = dropped {
            log::warn!("unable to drop test database {}: {}", self.name, e);
        }
    }
}

/// Replace the database path of a `postgresql://` URI, keeping any query string
fn with_database(url: &str, name: &str) -> Option<String> {
    let authority = url.find("://")? + 3;
    let (base, query) = match url.find('?') {
        Some(i) => url.split_at(i),
        None => (url, ""),
    };
    let path = base[authority..]
        .find('/')
        .map_or(base.len(), |i| authority + i);
    Some(format!("{}/{}{}", &base[..path], name, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_database() {
        assert_eq!(
            with_database("postgres://postgres:@127.0.0.1:5432/postgres?sslmode=disable", "t1"),
            Some("postgres://postgres:@127.0.0.1:5432/t1?sslmode=disable".to_string())
        );
        assert_eq!(
            with_database("postgresql://localhost", "t2"),
            Some("postgresql://localhost/t2".to_string())
        );
        assert_eq!(with_database("host=localhost dbname=x", "t3"), None);
    }
}
