//! Transactional access to the database.
//!
//! A [`Database`] owns one connection, a private single-threaded runtime used
//! to drive the async driver from blocking code, and the cached database
//! clock. It is meant to be owned by exactly one thread; see
//! [`StoragePool`](super::worker::StoragePool) for how workers each get their
//! own.
//!
//! ```no_run
//! use flowmaster::configuration::DatabaseConfig;
//! use flowmaster::storage::Database;
//!
//! let mut db = Database::new(&DatabaseConfig::default()).unwrap();
//! db.transaction(true, |cursor| {
//!     cursor.execute("DELETE FROM flows WHERE client = ?", vec![1.into()])?;
//!     cursor.nested(|inner| inner.execute("DELETE FROM clients WHERE id = ?", vec![1.into()]))
//! })
//! .unwrap();
//! ```

use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use sea_orm::{
    ConnectOptions, ConnectionTrait, DatabaseConnection, DatabaseTransaction, QueryResult,
    Statement, TransactionTrait, Value,
};
use tokio::runtime::Runtime;

use super::clock::DbClock;
use crate::configuration::DatabaseConfig;
use crate::error_handling::types::DbError;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS clients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS config (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        plugin TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        UNIQUE (plugin, name)
    )",
    "CREATE TABLE IF NOT EXISTS flow_filters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filter TEXT NOT NULL,
        epoch INTEGER NOT NULL,
        version INTEGER NOT NULL,
        address TEXT NOT NULL,
        added BOOLEAN NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS flow_filters_lookup
        ON flow_filters (filter, epoch, version)",
    "CREATE TABLE IF NOT EXISTS flows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        client INTEGER NOT NULL REFERENCES clients(id),
        ip_from TEXT NOT NULL,
        ip_to TEXT NOT NULL,
        port_from INTEGER NOT NULL,
        port_to INTEGER NOT NULL,
        proto TEXT NOT NULL,
        start TEXT NOT NULL,
        stop TEXT NOT NULL,
        opposite_start TEXT,
        size INTEGER NOT NULL,
        count INTEGER NOT NULL,
        inbound BOOLEAN NOT NULL
    )",
];

/// Reentrancy bookkeeping of one open transaction.
#[derive(Debug)]
struct ScopeState {
    depth: usize,
    poisoned: bool,
}

/// Handle to the open transaction, valid only inside the scope that created
/// it.
pub struct Cursor<'a> {
    rt: &'a Runtime,
    txn: &'a DatabaseTransaction,
    scope: &'a mut ScopeState,
}

impl Cursor<'_> {
    /// Runs `body` as a nested scope of the same transaction.
    ///
    /// Nothing is committed when the nested scope ends. If it fails, the
    /// whole transaction is rolled back at the outermost exit, even when the
    /// caller recovers from the error.
    pub fn nested<T, F>(&mut self, body: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Cursor<'_>) -> Result<T, DbError>,
    {
        self.scope.depth += 1;
        let result = body(self);
        self.scope.depth -= 1;
        if result.is_err() {
            self.scope.poisoned = true;
        }
        result
    }

    pub fn depth(&self) -> usize {
        self.scope.depth
    }

    pub fn execute(&mut self, sql: &str, values: Vec<Value>) -> Result<u64, DbError> {
        let stmt = Statement::from_sql_and_values(self.txn.get_database_backend(), sql, values);
        let result = self.rt.block_on(self.txn.execute(stmt))?;
        Ok(result.rows_affected())
    }

    pub fn query_all(&mut self, sql: &str, values: Vec<Value>) -> Result<Vec<QueryResult>, DbError> {
        let stmt = Statement::from_sql_and_values(self.txn.get_database_backend(), sql, values);
        Ok(self.rt.block_on(self.txn.query_all(stmt))?)
    }

    pub fn query_one(&mut self, sql: &str, values: Vec<Value>) -> Result<Option<QueryResult>, DbError> {
        let stmt = Statement::from_sql_and_values(self.txn.get_database_backend(), sql, values);
        Ok(self.rt.block_on(self.txn.query_one(stmt))?)
    }

    /// The transaction, for use with SeaORM entity queries driven by
    /// [`Cursor::block_on`].
    pub fn connection(&self) -> &DatabaseTransaction {
        self.txn
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.rt.block_on(future)
    }

    /// Current time according to the database, in UTC.
    pub fn database_time(&mut self) -> Result<DateTime<Utc>, DbError> {
        let row = self
            .query_one("SELECT strftime('%Y-%m-%dT%H:%M:%fZ', 'now') AS now", vec![])?
            .ok_or_else(|| DbError::BadRow("no row for current time".into()))?;
        let text: String = row.try_get("", "now")?;
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| DbError::BadRow(format!("current time {text:?}: {e}")))
    }
}

pub struct Database {
    settings: DatabaseConfig,
    rt: Runtime,
    connection: Option<DatabaseConnection>,
    clock: DbClock,
    serial: u64,
    slow_transactions: u64,
}

impl Database {
    /// Creates the handle. No connection is made until the first
    /// transaction.
    pub fn new(settings: &DatabaseConfig) -> Result<Self, DbError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(DbError::Runtime)?;
        Ok(Self {
            settings: settings.clone(),
            rt,
            connection: None,
            clock: DbClock::new(Duration::from_secs(settings.clock_refresh_secs)),
            serial: 0,
            slow_transactions: 0,
        })
    }

    /// Runs `body` inside a transaction: commit if it returns `Ok`, rollback
    /// otherwise (or if a nested scope failed, or if `body` panics).
    ///
    /// With `reuse`, the cached connection is first checked with `SELECT 1`
    /// and silently replaced if the check fails.
    pub fn transaction<T, F>(&mut self, reuse: bool, body: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Cursor<'_>) -> Result<T, DbError>,
    {
        let connection = if reuse {
            self.validated_connection()
        } else {
            self.connection()
        };

        self.serial += 1;
        let serial = self.serial;
        debug!("Entering transaction {serial}");
        let started = Instant::now();
        let entry_stack = Backtrace::force_capture();

        // The driver returns connections to its pool from a spawned task, so
        // anything dropped here needs the runtime context.
        let _context = self.rt.enter();
        let txn = self.rt.block_on(connection.begin())?;
        let mut scope = ScopeState {
            depth: 1,
            poisoned: false,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            body(&mut Cursor {
                rt: &self.rt,
                txn: &txn,
                scope: &mut scope,
            })
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!("Rollback of transaction {serial}: the body panicked");
                if let Err(rollback) = self.rt.block_on(txn.rollback()) {
                    error!("Rollback of transaction {serial} failed too: {rollback}");
                }
                resume_unwind(panic);
            }
        };

        let duration = started.elapsed();
        if duration > Duration::from_secs(self.settings.slow_transaction_secs) {
            self.slow_transactions += 1;
            warn!(
                "The transaction {serial} took a long time ({:.3} seconds): {entry_stack}",
                duration.as_secs_f64()
            );
        }

        match result {
            Ok(value) if !scope.poisoned => {
                debug!("Commit of transaction {serial}");
                self.rt.block_on(txn.commit())?;
                Ok(value)
            }
            Ok(_) => {
                error!("Rollback of transaction {serial}: a nested scope failed");
                self.rt.block_on(txn.rollback())?;
                Err(DbError::Poisoned)
            }
            Err(e) => {
                error!("Rollback of transaction {serial}: {e}");
                if let Err(rollback) = self.rt.block_on(txn.rollback()) {
                    error!("Rollback of transaction {serial} failed too: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Number of transactions that took longer than `slow_transaction_secs`.
    pub fn slow_transactions(&self) -> u64 {
        self.slow_transactions
    }

    /// Authoritative current time, from the cache when it is fresh enough.
    pub fn now(&mut self) -> Result<DateTime<Utc>, DbError> {
        if let Some(time) = self.clock.read(Instant::now()) {
            return Ok(time);
        }
        let db_time = self.transaction(true, |cursor| cursor.database_time())?;
        self.clock.update(db_time, Instant::now());
        Ok(db_time)
    }

    /// Creates missing tables and indexes.
    pub fn ensure_schema(&mut self) -> Result<(), DbError> {
        self.transaction(true, |cursor| {
            for sql in SCHEMA {
                cursor.block_on(cursor.connection().execute_unprepared(sql))?;
            }
            Ok(())
        })
    }

    fn connection(&mut self) -> DatabaseConnection {
        if let Some(connection) = &self.connection {
            return connection.clone();
        }
        debug!("Initializing connection to DB");
        let connection = self.connect();
        self.connection = Some(connection.clone());
        connection
    }

    fn validated_connection(&mut self) -> DatabaseConnection {
        let connection = self.connection();
        let probe = Statement::from_string(connection.get_database_backend(), "SELECT 1");
        match self.rt.block_on(connection.query_one(probe)) {
            Ok(_) => connection,
            Err(e) => {
                error!("Broken DB connection, recreating: {e}");
                self.connection = None;
                self.connection()
            }
        }
    }

    /// Blocks until a connection is established.
    fn connect(&self) -> DatabaseConnection {
        let mut options = ConnectOptions::new(self.settings.url.clone());
        options.max_connections(1).sqlx_logging(false);
        loop {
            match self.rt.block_on(sea_orm::Database::connect(options.clone())) {
                Ok(connection) => return connection,
                Err(e) => {
                    error!("Failed to create DB connection (blocking until it works): {e}");
                    std::thread::sleep(Duration::from_millis(self.settings.retry_delay_ms));
                }
            }
        }
    }
}
