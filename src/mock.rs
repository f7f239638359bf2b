//! In-memory database for exercising the coordinator without PostgreSQL
//!
//! [`MemoryDatabase`] implements [`Connector`] and hands out
//! [`MemoryConnection`]s that implement [`MigrationExecutor`]. It models the
//! parts of PostgreSQL that migrations depend on:
//!
//! - transactional DDL: changes made inside a transaction are invisible to
//!   other connections until commit and vanish on rollback
//! - session-scoped, re-entrant advisory locks that block other sessions and
//!   die with the connection
//! - bookkeeping tables with a primary key on `version`
//!
//! Scripts use a tiny DDL dialect, one statement per `;`:
//!
//! ```text
//! create table T
//! drop table [if exists] T
//! alter table T add column C
//! alter table T drop column C
//! alter table T rename to U
//! select 1
//! ```
//!
//! Anything else fails like a syntax error. One-shot failures can be armed
//! with [`MemoryDatabase::inject`].

use crate::connection::ConnectionError;
use crate::executor::{Connector, DbError, MigrationExecutor};
use crate::migration::state_table::StateTable;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// A one-shot failure, consumed by the first matching call on any connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Next `connect`
    Connect,
    /// Next `advisory_lock`
    Lock,
    /// Next `advisory_unlock`
    Unlock,
    /// Next `applied_versions`
    Read,
    /// Next `begin`
    Begin,
    /// Next `batch_execute`
    Script,
    /// Next `insert_version` or `delete_version`
    Bookkeeping,
    /// Next `commit`. The transaction is lost, as with a server-side abort.
    Commit,
    /// Next `close`. The connection is dropped anyway.
    Close,
}

#[derive(Debug, Clone, Default)]
struct Schema {
    /// Tables as `t`, columns as `t.c`
    objects: BTreeSet<String>,
    /// Bookkeeping tables and their recorded versions
    versions: BTreeMap<String, BTreeSet<i64>>,
}

#[derive(Debug, Default)]
struct State {
    schema: Schema,
    /// Lock key to (holding connection, hold count)
    locks: HashMap<i64, (u64, usize)>,
    faults: Vec<Fault>,
    open: usize,
    next_id: u64,
}

impl State {
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(i) => {
                self.faults.remove(i);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    unlocked: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A named in-memory database
///
/// Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    /// Create an empty database. `name` is its identity, which the advisory
    /// lock key is derived from.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::default(),
        }
    }

    /// Arm a one-shot failure
    pub fn inject(&self, fault: Fault) {
        self.shared.state().faults.push(fault);
    }

    /// Whether a committed table `t` or column `t.c` exists
    pub fn has_object(&self, name: &str) -> bool {
        self.shared.state().schema.objects.contains(name)
    }

    /// Committed versions in `table`, ascending, or `None` if the table does not exist
    pub fn applied_versions(&self, table: &StateTable) -> Option<Vec<i64>> {
        self.shared
            .state()
            .schema
            .versions
            .get(table.name())
            .map(|set| set.iter().copied().collect())
    }

    /// Record `version` in `table` directly, creating the table if needed
    pub fn record_version(&self, table: &StateTable, version: i64) {
        self.shared
            .state()
            .schema
            .versions
            .entry(table.name().to_string())
            .or_default()
            .insert(version);
    }

    /// Whether any session holds the advisory lock `key`
    pub fn is_locked(&self, key: i64) -> bool {
        self.shared.state().locks.contains_key(&key)
    }

    /// Number of connections not yet closed
    pub fn open_connections(&self) -> usize {
        self.shared.state().open
    }
}

impl Connector for MemoryDatabase {
    type Executor = MemoryConnection;

    fn identity(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<MemoryConnection, ConnectionError> {
        let mut state = self.shared.state();
        if state.take_fault(Fault::Connect) {
            return Err(ConnectionError::Other(format!(
                "could not connect to {}",
                self.name
            )));
        }
        state.open += 1;
        state.next_id += 1;
        Ok(MemoryConnection {
            id: state.next_id,
            shared: Arc::clone(&self.shared),
            transaction: RefCell::new(None),
        })
    }
}

/// One session on a [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    /// Private copy of the schema while a transaction is open
    transaction: RefCell<Option<Schema>>,
}

impl MemoryConnection {
    fn fault(&self, fault: Fault) -> Result<(), DbError> {
        if self.shared.state().take_fault(fault) {
            return Err(DbError::Other(format!("injected {fault:?} failure")));
        }
        Ok(())
    }

    /// Run `f` against this session's view of the schema
    ///
    /// Inside a transaction `f` mutates the private copy. Outside one the
    /// change is applied atomically to the shared schema, or not at all.
    fn with_schema<R>(
        &self,
        f: impl FnOnce(&mut Schema) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        if let Some(schema) = self.transaction.borrow_mut().as_mut() {
            return f(schema);
        }
        let mut state = self.shared.state();
        let mut schema = state.schema.clone();
        let result = f(&mut schema)?;
        state.schema = schema;
        Ok(result)
    }
}

impl MigrationExecutor for MemoryConnection {
    fn batch_execute(&self, script: &str) -> Result<(), DbError> {
        self.fault(Fault::Script)?;
        self.with_schema(|schema| {
            script
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .try_for_each(|statement| execute(schema, statement))
        })
    }

    fn begin(&self) -> Result<(), DbError> {
        self.fault(Fault::Begin)?;
        let mut transaction = self.transaction.borrow_mut();
        if transaction.is_some() {
            return Err(DbError::Query(
                "there is already a transaction in progress".to_string(),
            ));
        }
        *transaction = Some(self.shared.state().schema.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), DbError> {
        let staged = self.transaction.borrow_mut().take();
        self.fault(Fault::Commit)?;
        if let Some(schema) = staged {
            self.shared.state().schema = schema;
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.transaction.borrow_mut().take();
        Ok(())
    }

    fn advisory_lock(&self, key: i64) -> Result<(), DbError> {
        let mut state = self.shared.state();
        if state.take_fault(Fault::Lock) {
            return Err(DbError::Other(format!("injected lock failure on {key}")));
        }
        while matches!(state.locks.get(&key), Some((holder, _)) if *holder != self.id) {
            state = self
                .shared
                .unlocked
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.locks.entry(key).or_insert((self.id, 0)).1 += 1;
        Ok(())
    }

    fn advisory_unlock(&self, key: i64) -> Result<(), DbError> {
        let mut state = self.shared.state();
        if state.take_fault(Fault::Unlock) {
            return Err(DbError::Other(format!("injected unlock failure on {key}")));
        }
        match state.locks.get_mut(&key) {
            Some((holder, count)) if *holder == self.id => {
                *count -= 1;
                if *count == 0 {
                    state.locks.remove(&key);
                    self.shared.unlocked.notify_all();
                }
                Ok(())
            }
            _ => Err(DbError::Other(format!(
                "advisory lock {key} was not held by this session"
            ))),
        }
    }

    fn table_exists(&self, table: &StateTable) -> Result<bool, DbError> {
        self.with_schema(|schema| Ok(schema.versions.contains_key(table.name())))
    }

    fn create_table(&self, table: &StateTable) -> Result<(), DbError> {
        self.with_schema(|schema| {
            schema.versions.entry(table.name().to_string()).or_default();
            Ok(())
        })
    }

    fn applied_versions(&self, table: &StateTable) -> Result<Vec<i64>, DbError> {
        self.fault(Fault::Read)?;
        self.with_schema(|schema| {
            versions(schema, table).map(|set| set.iter().copied().collect())
        })
    }

    fn insert_version(&self, table: &StateTable, version: i64) -> Result<(), DbError> {
        self.fault(Fault::Bookkeeping)?;
        self.with_schema(|schema| {
            if !versions(schema, table)?.insert(version) {
                return Err(DbError::Query(format!(
                    "duplicate key value violates unique constraint: version {version}"
                )));
            }
            Ok(())
        })
    }

    fn delete_version(&self, table: &StateTable, version: i64) -> Result<(), DbError> {
        self.fault(Fault::Bookkeeping)?;
        self.with_schema(|schema| {
            if !versions(schema, table)?.remove(&version) {
                return Err(DbError::Query(format!(
                    "no row for version {version} in {}",
                    table.name()
                )));
            }
            Ok(())
        })
    }

    fn close(self) -> Result<(), DbError> {
        self.fault(Fault::Close)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        let id = self.id;
        let before = state.locks.len();
        state.locks.retain(|_, (holder, _)| *holder != id);
        if state.locks.len() != before {
            self.shared.unlocked.notify_all();
        }
        state.open -= 1;
    }
}

fn versions<'s>(
    schema: &'s mut Schema,
    table: &StateTable,
) -> Result<&'s mut BTreeSet<i64>, DbError> {
    schema
        .versions
        .get_mut(table.name())
        .ok_or_else(|| DbError::Query(format!("relation \"{}\" does not exist", table.name())))
}

fn execute(schema: &mut Schema, statement: &str) -> Result<(), DbError> {
    let lowered = statement.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let objects = &mut schema.objects;

    match words.as_slice() {
        ["select", "1"] => Ok(()),
        ["create", "table", table] => {
            if !objects.insert(table.to_string()) {
                return Err(DbError::Query(format!(
                    "relation \"{table}\" already exists"
                )));
            }
            Ok(())
        }
        ["drop", "table", "if", "exists", table] => {
            drop_table(objects, table);
            Ok(())
        }
        ["drop", "table", table] => {
            require_table(objects, table)?;
            drop_table(objects, table);
            Ok(())
        }
        ["alter", "table", table, "add", "column", column] => {
            require_table(objects, table)?;
            if !objects.insert(format!("{table}.{column}")) {
                return Err(DbError::Query(format!(
                    "column \"{column}\" of relation \"{table}\" already exists"
                )));
            }
            Ok(())
        }
        ["alter", "table", table, "drop", "column", column] => {
            require_table(objects, table)?;
            if !objects.remove(&format!("{table}.{column}")) {
                return Err(DbError::Query(format!(
                    "column \"{column}\" of relation \"{table}\" does not exist"
                )));
            }
            Ok(())
        }
        ["alter", "table", table, "rename", "to", renamed] => {
            require_table(objects, table)?;
            if objects.contains(*renamed) {
                return Err(DbError::Query(format!(
                    "relation \"{renamed}\" already exists"
                )));
            }
            let prefix = format!("{table}.");
            let moved: Vec<String> = objects
                .iter()
                .filter(|o| o.as_str() == *table || o.starts_with(&prefix))
                .cloned()
                .collect();
            for object in moved {
                objects.remove(&object);
                objects.insert(format!("{renamed}{}", &object[table.len()..]));
            }
            Ok(())
        }
        _ => Err(DbError::Query(format!(
            "syntax error at or near \"{}\"",
            words.first().copied().unwrap_or(statement)
        ))),
    }
}

fn require_table(objects: &BTreeSet<String>, table: &str) -> Result<(), DbError> {
    if !objects.contains(table) {
        return Err(DbError::Query(format!(
            "relation \"{table}\" does not exist"
        )));
    }
    Ok(())
}

fn drop_table(objects: &mut BTreeSet<String>, table: &str) {
    let prefix = format!("{table}.");
    objects.retain(|o| o != table && !o.starts_with(&prefix));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_dialect() {
        let db = MemoryDatabase::new("memory://dialect");
        let conn = db.connect().unwrap();

        conn.batch_execute("create table users; alter table users add column birthday")
            .unwrap();
        assert!(db.has_object("users"));
        assert!(db.has_object("users.birthday"));

        conn.batch_execute("ALTER TABLE users RENAME TO people").unwrap();
        assert!(!db.has_object("users"));
        assert!(db.has_object("people.birthday"));

        conn.batch_execute("drop table people").unwrap();
        assert!(!db.has_object("people"));
        assert!(!db.has_object("people.birthday"));

        conn.batch_execute("drop table if exists people; select 1").unwrap();
    }

    #[test]
    fn test_failed_script_outside_transaction_changes_nothing() {
        let db = MemoryDatabase::new("memory://autocommit");
        let conn = db.connect().unwrap();

        let err = conn
            .batch_execute("create table widgets; this is not sql")
            .unwrap_err();
        assert!(matches!(err, DbError::Query(_)));
        assert!(!db.has_object("widgets"));
    }

    #[test]
    fn test_transaction_is_private_until_commit() {
        let db = MemoryDatabase::new("memory://isolation");
        let a = db.connect().unwrap();
        let b = db.connect().unwrap();

        a.begin().unwrap();
        a.batch_execute("create table widgets").unwrap();
        b.batch_execute("create table gadgets").unwrap();
        assert!(!db.has_object("widgets"));

        a.commit().unwrap();
        assert!(db.has_object("widgets"));
    }

    #[test]
    fn test_bookkeeping_constraints() {
        let db = MemoryDatabase::new("memory://bookkeeping");
        let conn = db.connect().unwrap();
        let table = StateTable::default();

        assert!(conn.applied_versions(&table).is_err());
        conn.create_table(&table).unwrap();
        conn.insert_version(&table, 2).unwrap();
        conn.insert_version(&table, 1).unwrap();
        assert!(conn.insert_version(&table, 1).is_err());
        assert_eq!(conn.applied_versions(&table).unwrap(), vec![1, 2]);

        conn.delete_version(&table, 2).unwrap();
        assert!(conn.delete_version(&table, 2).is_err());
        assert_eq!(db.applied_versions(&table), Some(vec![1]));
    }

    #[test]
    fn test_faults_fire_once() {
        let db = MemoryDatabase::new("memory://faults");
        db.inject(Fault::Script);
        let conn = db.connect().unwrap();

        assert!(conn.batch_execute("select 1").is_err());
        assert!(conn.batch_execute("select 1").is_ok());
    }

    #[test]
    fn test_failed_close_still_releases_the_connection() {
        let db = MemoryDatabase::new("memory://close-fault");
        db.inject(Fault::Begin);
        db.inject(Fault::Close);
        let conn = db.connect().unwrap();
        conn.advisory_lock(7).unwrap();

        assert!(conn.begin().is_err());
        assert!(conn.begin().is_ok());
        conn.rollback().unwrap();

        assert!(conn.close().is_err());
        assert!(!db.is_locked(7));
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn test_advisory_lock_blocks_other_sessions() {
        let db = MemoryDatabase::new("memory://blocking");
        let holder = db.connect().unwrap();
        holder.advisory_lock(42).unwrap();
        // Re-entrant for the holding session
        holder.advisory_lock(42).unwrap();

        let waiter = {
            let db = db.clone();
            thread::spawn(move || {
                let conn = db.connect().unwrap();
                conn.advisory_lock(42).unwrap();
                conn.advisory_unlock(42).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        holder.advisory_unlock(42).unwrap();
        assert!(db.is_locked(42));
        holder.advisory_unlock(42).unwrap();

        waiter.join().unwrap();
        assert!(!db.is_locked(42));
        assert!(holder.advisory_unlock(42).is_err());
    }

    #[test]
    fn test_dropping_connection_releases_locks() {
        let db = MemoryDatabase::new("memory://drop");
        let conn = db.connect().unwrap();
        conn.advisory_lock(1).unwrap();
        assert_eq!(db.open_connections(), 1);

        drop(conn);
        assert!(!db.is_locked(1));
        assert_eq!(db.open_connections(), 0);
    }
}
