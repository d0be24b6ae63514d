use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{OptionalExtension, Row, ToSql};

use super::collection::ConnectionCollection;
use super::connection::ShardConn;
use crate::errors::ShardError;

/// The database capabilities the directory and updater rely on.
///
/// Implementations decide whether statements run inside an open transaction
/// or directly against the session; callers only see these operations.
pub trait Executor {
    /// Name of the shard the active session is bound to.
    fn shard(&self) -> &str;

    /// Run a statement that returns no rows; yields the affected row count.
    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize, ShardError>;

    /// Run a script of semicolon-separated statements, typically DDL.
    fn execute_batch(&self, sql: &str) -> Result<(), ShardError>;

    /// Run a query and map every row.
    fn query<T, F>(&self, sql: &str, params: &[&dyn ToSql], map: F) -> Result<Vec<T>, ShardError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>;

    /// Run a query and map the first row, if any.
    ///
    /// Also the way to read `INSERT ... RETURNING` results, which come back
    /// from the same statement that wrote them.
    fn query_opt<T, F>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: F,
    ) -> Result<Option<T>, ShardError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>;

    fn begin(&mut self) -> Result<(), ShardError>;
    fn commit(&mut self) -> Result<(), ShardError>;
    fn rollback(&mut self) -> Result<(), ShardError>;
    fn in_transaction(&self) -> bool;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Execution context bound to one shard session at a time.
///
/// A context is owned by exactly one task. It may be rebound to another
/// shard (see [`crate::directory::fetch_shard_by_email`]) but never while a
/// transaction or savepoint is open.
///
/// While its transaction or outermost savepoint is open the context owns the
/// session's connection: statements from other contexts on the same shard
/// wait until it commits, rolls back or is dropped.
pub struct Context {
    id: u64,
    connections: Arc<ConnectionCollection>,
    session: ShardConn,
    tx_open: bool,
    savepoints: usize,
}

impl Context {
    pub fn new(connections: Arc<ConnectionCollection>, session: ShardConn) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            connections,
            session,
            tx_open: false,
            savepoints: 0,
        }
    }

    /// The active session.
    pub fn session(&self) -> &ShardConn {
        &self.session
    }

    pub fn connections(&self) -> &Arc<ConnectionCollection> {
        &self.connections
    }

    /// Switch the active session to another shard connection.
    pub fn rebind(&mut self, session: ShardConn) -> Result<(), ShardError> {
        if self.in_transaction() {
            return Err(ShardError::transaction(
                self.session.name(),
                "rebind",
                format!("cannot switch to shard {} inside an open transaction", session.name()),
            ));
        }
        tracing::debug!(from = self.session.name(), to = session.name(), "rebinding context");
        self.session = session;
        Ok(())
    }

    /// Run `f` inside a savepoint: released when `f` succeeds, rolled back when it fails.
    ///
    /// Nests inside an open transaction; outside one, the savepoint is its own
    /// transaction and releasing it commits. If `f` panics the savepoint stays
    /// counted and dropping the context rolls it back.
    pub fn savepoint<T, F>(&mut self, f: F) -> Result<T, ShardError>
    where
        F: FnOnce(&mut Self) -> Result<T, ShardError>,
    {
        let outermost = !self.in_transaction();
        let name = format!("shardkit_sp_{}", self.savepoints);
        let id = self.id;
        let shard = self.session.name().to_string();
        self.session.exclusive(Some(id), |slot| {
            slot.conn
                .execute_batch(&format!("SAVEPOINT {name}"))
                .map_err(|e| ShardError::transaction(&shard, "savepoint", e))?;
            slot.owner = Some(id);
            Ok(())
        })?;
        self.savepoints += 1;
        let result = f(self);
        self.savepoints -= 1;

        match (result, outermost) {
            (Ok(value), true) => {
                self.finish("release", &format!("RELEASE {name}"))?;
                Ok(value)
            }
            (Ok(value), false) => {
                self.batch("release", &format!("RELEASE {name}"))?;
                Ok(value)
            }
            (Err(e), true) => {
                self.finish("rollback", &format!("ROLLBACK TO {name}; RELEASE {name}"))?;
                Err(e)
            }
            (Err(e), false) => {
                self.batch("rollback", &format!("ROLLBACK TO {name}; RELEASE {name}"))?;
                Err(e)
            }
        }
    }

    fn batch(&self, op: &'static str, sql: &str) -> Result<(), ShardError> {
        let shard = self.session.name();
        self.session.exclusive(Some(self.id), |slot| {
            slot.conn
                .execute_batch(sql)
                .map_err(|e| ShardError::transaction(shard, op, e))
        })
    }

    /// Run the statement that ends the outermost transaction.
    ///
    /// When it fails and SQLite still reports an open transaction, roll back
    /// so the connection is never handed back mid-transaction. The context
    /// keeps ownership only if even that rollback fails.
    fn finish(&mut self, op: &'static str, sql: &str) -> Result<(), ShardError> {
        let shard = self.session.name().to_string();
        let (outcome, closed) = self.session.exclusive(Some(self.id), |slot| {
            let outcome = slot.conn.execute_batch(sql);
            if outcome.is_err() && !slot.conn.is_autocommit() {
                if let Err(e) = slot.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(shard = %shard, op, error = %e, "fallback rollback failed");
                }
            }
            let closed = slot.conn.is_autocommit();
            if closed {
                slot.owner = None;
            }
            Ok((outcome, closed))
        })?;
        self.tx_open = !closed;
        outcome.map_err(|e| ShardError::transaction(&shard, op, e))
    }
}

impl Executor for Context {
    fn shard(&self) -> &str {
        self.session.name()
    }

    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize, ShardError> {
        self.session.run_as(Some(self.id), |c| c.execute(sql, params))
    }

    fn execute_batch(&self, sql: &str) -> Result<(), ShardError> {
        self.session.run_as(Some(self.id), |c| c.execute_batch(sql))
    }

    fn query<T, F>(&self, sql: &str, params: &[&dyn ToSql], map: F) -> Result<Vec<T>, ShardError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.session.run_as(Some(self.id), |c| {
            let mut stmt = c.prepare(sql)?;
            let rows = stmt.query_map(params, map)?;
            rows.collect()
        })
    }

    fn query_opt<T, F>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: F,
    ) -> Result<Option<T>, ShardError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.session
            .run_as(Some(self.id), |c| c.query_row(sql, params, map).optional())
    }

    fn begin(&mut self) -> Result<(), ShardError> {
        if self.in_transaction() {
            return Err(ShardError::transaction(
                self.session.name(),
                "begin",
                "transaction already open",
            ));
        }
        let id = self.id;
        let shard = self.session.name();
        self.session.exclusive(Some(id), |slot| {
            slot.conn
                .execute_batch("BEGIN")
                .map_err(|e| ShardError::transaction(shard, "begin", e))?;
            slot.owner = Some(id);
            Ok(())
        })?;
        self.tx_open = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ShardError> {
        if !self.tx_open || self.savepoints > 0 {
            return Err(ShardError::transaction(
                self.session.name(),
                "commit",
                "no transaction open at this level",
            ));
        }
        self.finish("commit", "COMMIT")
    }

    fn rollback(&mut self) -> Result<(), ShardError> {
        if !self.tx_open || self.savepoints > 0 {
            return Err(ShardError::transaction(
                self.session.name(),
                "rollback",
                "no transaction open at this level",
            ));
        }
        self.finish("rollback", "ROLLBACK")
    }

    fn in_transaction(&self) -> bool {
        self.tx_open || self.savepoints > 0
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.in_transaction() {
            tracing::debug!(shard = self.session.name(), "rolling back transaction left open on drop");
        }
        self.session.abandon(self.id);
    }
}
