//! Purpose: The synchronous database handle and its scoped transactions.
//! Exports: `ItemDb`, `Transaction`, `DbOptions`, `ApiResult`, `MEMORY_PATH`.
//! Role: Owns one connection, the transaction state machine and the schema cache.
//! Invariants: Writes require an active transaction; reads run with or without one.
//! Invariants: The schema cache is dropped on rollback since it may describe undone DDL.
#![allow(clippy::result_large_err)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rusqlite::Connection;
use serde_json::Value;

use crate::core::codec::Item;
use crate::core::error::{Error, ErrorKind, sqlite_error};
use crate::core::query;
use crate::core::schema::{self, TableSchema};
use crate::core::txn::{TxContext, TxState};

pub type ApiResult<T> = Result<T, Error>;

/// Reserved path for an ephemeral in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub struct DbOptions {
    pub busy_timeout: Duration,
}

impl DbOptions {
    pub fn new() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// How long `begin()` waits for another connection's write lock.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

impl Default for DbOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A transactional store of JSON items backed by one SQLite connection.
///
/// Tables are created with [`ItemDb::ensure_table`]. Writes (`put`, `delete`,
/// `delete_table`, `rename_table`) must happen inside a transaction, opened
/// with [`ItemDb::transaction`] or [`ItemDb::begin_scope`].
pub struct ItemDb {
    conn: Connection,
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
    tx: TxContext,
    schemas: RefCell<HashMap<String, TableSchema>>,
}

impl ItemDb {
    pub fn open(path: impl AsRef<Path>) -> ApiResult<Self> {
        Self::open_with(path, DbOptions::default())
    }

    pub fn open_in_memory() -> ApiResult<Self> {
        Self::open_with(MEMORY_PATH, DbOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: DbOptions) -> ApiResult<Self> {
        let path = path.as_ref();
        let in_memory = path == Path::new(MEMORY_PATH);
        let mtime = if in_memory {
            None
        } else {
            std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
        };
        let conn = if in_memory {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|err| sqlite_error(err).with_path(path))?;
        conn.busy_timeout(options.busy_timeout)
            .map_err(|err| sqlite_error(err).with_path(path))?;
        tracing::debug!(path = %path.display(), busy_timeout = ?options.busy_timeout, "opened database");

        Ok(Self {
            conn,
            path: (!in_memory).then(|| path.to_path_buf()),
            mtime,
            tx: TxContext::new(),
            schemas: RefCell::new(HashMap::new()),
        })
    }

    /// Closes the connection, rolling back a transaction left open.
    pub fn close(mut self) -> ApiResult<()> {
        if self.tx.is_active() {
            self.rollback()?;
        }
        let path = self.path.clone();
        self.conn.close().map_err(|(_, err)| {
            let err = sqlite_error(err).with_message("failed to close database");
            match path {
                Some(path) => err.with_path(path),
                None => err,
            }
        })
    }

    /// `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Modification time of the file when it was opened; `None` if it did not exist.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    pub fn tx_state(&self) -> TxState {
        self.tx.state()
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_active()
    }

    pub fn begin(&mut self) -> ApiResult<()> {
        self.tx.begin(&self.conn)
    }

    /// A failed commit rolls back and leaves the handle idle.
    pub fn commit(&mut self) -> ApiResult<()> {
        let result = self.tx.commit(&self.conn);
        if result.is_err() {
            self.schemas.borrow_mut().clear();
        }
        result
    }

    pub fn rollback(&mut self) -> ApiResult<()> {
        self.schemas.borrow_mut().clear();
        self.tx.rollback(&self.conn)
    }

    /// Begins a transaction that rolls back when the guard drops without `commit()`.
    pub fn begin_scope(&mut self) -> ApiResult<Transaction<'_>> {
        self.begin()?;
        Ok(Transaction {
            db: self,
            finished: false,
        })
    }

    /// Runs `f` in a transaction: `Ok` commits, `Err` rolls back and is returned unchanged.
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut ItemDb) -> Result<T, E>,
        E: From<Error>,
    {
        let mut scope = self.begin_scope()?;
        match f(&mut *scope) {
            Ok(value) => {
                scope.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = scope.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after failed transaction failed");
                }
                Err(err)
            }
        }
    }

    /// Sorted names of all tables.
    pub fn table_names(&self) -> ApiResult<Vec<String>> {
        schema::table_names(&self.conn)
    }

    /// Index specs of `table`, or `NotFound`.
    pub fn get_indices(&self, table: &str) -> ApiResult<TableSchema> {
        self.resolve(table)
    }

    /// Makes sure `table` exists with at least the given index specs.
    ///
    /// Specs prefixed with `!` are mandatory and unique; they can only be
    /// declared when the table is first created. New optional indices may be
    /// added later, and existing items are re-indexed for them. Outside a
    /// transaction this runs in its own.
    pub fn ensure_table<S: AsRef<str>>(&mut self, table: &str, specs: &[S]) -> ApiResult<TableSchema> {
        schema::validate_table_name(table)?;
        let requested = schema::parse_specs(specs)?;
        if let Some(existing) = self.lookup(table)? {
            if schema::plan_extension(&existing, &requested)?.is_noop() {
                return Ok(existing);
            }
        }
        if self.in_transaction() {
            self.apply_ensure(table, &requested)
        } else {
            self.transaction(|db| db.apply_ensure(table, &requested))
        }
    }

    fn apply_ensure(&mut self, table: &str, requested: &[schema::IndexSpec]) -> ApiResult<TableSchema> {
        // Read again under the write lock; another connection may have been first.
        let ensured = match schema::read_schema(&self.conn, table)? {
            None => {
                let created = TableSchema::new(table, requested.to_vec());
                schema::create_table(&self.conn, &created)?;
                created
            }
            Some(existing) => {
                let plan = schema::plan_extension(&existing, requested)?;
                for spec in &plan.added {
                    schema::add_index(&self.conn, table, spec)?;
                }
                let mut indices = existing.indices().to_vec();
                indices.extend(plan.added.iter().cloned());
                let extended = TableSchema::new(table, indices);
                if !plan.is_noop() {
                    let fields: Vec<&str> = plan.added.iter().map(|spec| spec.field()).collect();
                    let reindexed = query::backfill(&self.conn, &extended, &fields)?;
                    tracing::debug!(table, reindexed, "re-indexed items for new indices");
                }
                extended
            }
        };
        self.schemas
            .borrow_mut()
            .insert(cache_key(table), ensured.clone());
        Ok(ensured)
    }

    /// Drops `table` and all of its items.
    pub fn delete_table(&mut self, table: &str) -> ApiResult<()> {
        self.resolve(table)?;
        self.tx.require_active("delete_table")?;
        schema::drop_table(&self.conn, table)?;
        self.schemas.borrow_mut().remove(&cache_key(table));
        Ok(())
    }

    pub fn rename_table(&mut self, table: &str, new_table: &str) -> ApiResult<()> {
        let current = self.resolve(table)?;
        schema::validate_table_name(new_table)?;
        self.tx.require_active("rename_table")?;
        if self.lookup(new_table)?.is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message(format!("cannot rename to '{new_table}': table exists"))
                .with_table(table));
        }
        schema::rename_table(&self.conn, &current, new_table)?;
        let mut schemas = self.schemas.borrow_mut();
        schemas.remove(&cache_key(table));
        schemas.insert(
            cache_key(new_table),
            TableSchema::new(new_table, current.indices().to_vec()),
        );
        Ok(())
    }

    pub fn count_all(&self, table: &str) -> ApiResult<u64> {
        let schema = self.resolve(table)?;
        query::count(&self.conn, &schema, None, &[])
    }

    /// Counts items matching `filter`, e.g. `count("persons", "age > ?", &[json!(20)])`.
    pub fn count(&self, table: &str, filter: &str, args: &[Value]) -> ApiResult<u64> {
        let schema = self.resolve(table)?;
        query::count(&self.conn, &schema, Some(filter), args)
    }

    pub fn select_all(&self, table: &str) -> ApiResult<Vec<Item>> {
        let schema = self.resolve(table)?;
        query::select(&self.conn, &schema, None, &[], None)
    }

    /// Items matching `filter`, in insertion order.
    ///
    /// The filter is an SQLite expression over indexed fields only, with `?`
    /// placeholders bound to `args`. Fields without an index are rejected with
    /// `UnindexedField`; filter non-indexed fields on `select_all()` output instead.
    pub fn select(&self, table: &str, filter: &str, args: &[Value]) -> ApiResult<Vec<Item>> {
        let schema = self.resolve(table)?;
        query::select(&self.conn, &schema, Some(filter), args, None)
    }

    /// First matching item by insertion order.
    pub fn select_one(&self, table: &str, filter: &str, args: &[Value]) -> ApiResult<Option<Item>> {
        let schema = self.resolve(table)?;
        query::select_one(&self.conn, &schema, filter, args)
    }

    /// Inserts or updates items. Items sharing a unique value with a stored
    /// item replace it; without unique indices every put appends.
    pub fn put(&mut self, table: &str, items: &[Item]) -> ApiResult<()> {
        let schema = self.resolve(table)?;
        self.tx.require_active("put")?;
        query::put(&self.conn, &schema, items)
    }

    pub fn put_one(&mut self, table: &str, item: Item) -> ApiResult<()> {
        self.put(table, std::slice::from_ref(&item))
    }

    /// Deletes matching items and returns how many were removed.
    pub fn delete(&mut self, table: &str, filter: &str, args: &[Value]) -> ApiResult<u64> {
        let schema = self.resolve(table)?;
        self.tx.require_active("delete")?;
        query::delete(&self.conn, &schema, filter, args)
    }

    fn lookup(&self, table: &str) -> ApiResult<Option<TableSchema>> {
        schema::validate_table_name(table)?;
        if let Some(cached) = self.schemas.borrow().get(&cache_key(table)) {
            return Ok(Some(cached.clone()));
        }
        let found = schema::read_schema(&self.conn, table)?;
        if let Some(found) = &found {
            self.schemas
                .borrow_mut()
                .insert(cache_key(table), found.clone());
        }
        Ok(found)
    }

    fn resolve(&self, table: &str) -> ApiResult<TableSchema> {
        self.lookup(table)?.ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("table '{table}' not present"))
                .with_hint("Create it first with ensure_table().")
                .with_table(table)
        })
    }
}

// The engine matches table names without regard to ASCII case.
fn cache_key(table: &str) -> String {
    table.to_ascii_lowercase()
}

/// Guard for a transaction begun with [`ItemDb::begin_scope`].
///
/// Dereferences to the database so all operations are available; dropping it
/// without `commit()` rolls back.
pub struct Transaction<'db> {
    db: &'db mut ItemDb,
    finished: bool,
}

impl Transaction<'_> {
    pub fn commit(mut self) -> ApiResult<()> {
        self.finished = true;
        self.db.commit()
    }

    pub fn rollback(mut self) -> ApiResult<()> {
        self.finished = true;
        self.db.rollback()
    }
}

impl Deref for Transaction<'_> {
    type Target = ItemDb;

    fn deref(&self) -> &ItemDb {
        &*self.db
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut ItemDb {
        &mut *self.db
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && self.db.in_transaction() {
            if let Err(err) = self.db.rollback() {
                tracing::warn!(error = %err, "rollback of abandoned transaction failed");
            }
        }
    }
}
