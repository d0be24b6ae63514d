use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OpenFlags};

use crate::config::ShardConfig;
use crate::errors::ShardError;

/// Cheaply cloneable handle to one shard's SQLite connection.
///
/// Access goes through a `Mutex`; [`ShardConn::call`] runs the closure on
/// tokio's blocking thread pool so synchronous SQLite I/O never ties up async
/// worker threads.
///
/// SQLite transactions belong to the connection, not to a statement, so a
/// [`crate::db::Context`] that opens one claims the connection until it ends.
/// Everyone else waits on the `released` condvar in the meantime.
#[derive(Clone)]
pub struct ShardConn {
    name: Arc<str>,
    inner: Arc<Shared>,
}

struct Shared {
    slot: Mutex<Slot>,
    released: Condvar,
}

/// The connection plus the id of the context whose transaction is open on it.
pub(crate) struct Slot {
    pub(crate) conn: Connection,
    pub(crate) owner: Option<u64>,
}

impl std::fmt::Debug for ShardConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConn").field("name", &self.name).finish()
    }
}

impl ShardConn {
    /// Open the shard described by `config` and bootstrap its system tables.
    pub fn open(config: &ShardConfig) -> Result<Self, ShardError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&config.url, flags).map_err(|e| {
            ShardError::Config(format!(
                "shard '{}' is unreachable at '{}': {}",
                config.name, config.url, e
            ))
        })?;
        Self::from_connection(&config.name, conn)
    }

    /// Create an in-memory shard (for testing).
    pub fn open_in_memory(name: &str) -> Result<Self, ShardError> {
        let conn = Connection::open_in_memory().map_err(|e| ShardError::database(name, e))?;
        Self::from_connection(name, conn)
    }

    fn from_connection(name: &str, conn: Connection) -> Result<Self, ShardError> {
        init(&conn).map_err(|e| ShardError::database(name, e))?;
        Ok(Self {
            name: Arc::from(name),
            inner: Arc::new(Shared {
                slot: Mutex::new(Slot { conn, owner: None }),
                released: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` against the locked connection, tagging SQLite errors with the shard name.
    ///
    /// Blocks while a context holds a transaction open on this shard, so the
    /// statement never lands inside someone else's transaction. Callers on an
    /// async path should go through [`ShardConn::call`] instead.
    pub fn with_conn<F, R>(&self, f: F) -> Result<R, ShardError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R>,
    {
        self.run_as(None, f)
    }

    /// [`ShardConn::with_conn`] on behalf of context `owner`, which may
    /// already hold the connection.
    pub(crate) fn run_as<F, R>(&self, owner: Option<u64>, f: F) -> Result<R, ShardError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R>,
    {
        self.exclusive(owner, |slot| {
            f(&slot.conn).map_err(|e| ShardError::database(&self.name, e))
        })
    }

    /// Lock the slot once it is free or already held by `owner`, then run `f`.
    ///
    /// `f` may claim or release the connection by setting `slot.owner`;
    /// waiters are woken whenever ownership changes.
    pub(crate) fn exclusive<F, R>(&self, owner: Option<u64>, f: F) -> Result<R, ShardError>
    where
        F: FnOnce(&mut Slot) -> Result<R, ShardError>,
    {
        let mut slot = self.acquire(owner)?;
        let before = slot.owner;
        let result = f(&mut slot);
        if slot.owner != before {
            self.inner.released.notify_all();
        }
        result
    }

    fn acquire(&self, owner: Option<u64>) -> Result<MutexGuard<'_, Slot>, ShardError> {
        let poisoned = || ShardError::LockPoisoned(self.name.to_string());
        let mut slot = self.inner.slot.lock().map_err(|_| poisoned())?;
        while slot.owner.is_some() && slot.owner != owner {
            slot = self.inner.released.wait(slot).map_err(|_| poisoned())?;
        }
        Ok(slot)
    }

    /// Roll back whatever `owner` left open and hand the connection back.
    ///
    /// Runs from `Drop`, possibly while unwinding, so it never waits on the
    /// condvar and recovers a poisoned lock instead of failing.
    pub(crate) fn abandon(&self, owner: u64) {
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.owner != Some(owner) {
            return;
        }
        self.inner.slot.clear_poison();
        if !slot.conn.is_autocommit() {
            if let Err(e) = slot.conn.execute_batch("ROLLBACK") {
                tracing::warn!(shard = %self.name, error = %e, "rollback of abandoned transaction failed");
            }
        }
        slot.owner = None;
        self.inner.released.notify_all();
    }

    /// True when no transaction is open on the connection and no context owns it.
    ///
    /// Does not wait for a current owner to finish.
    pub fn is_idle(&self) -> Result<bool, ShardError> {
        let slot = self
            .inner
            .slot
            .lock()
            .map_err(|_| ShardError::LockPoisoned(self.name.to_string()))?;
        Ok(slot.owner.is_none() && slot.conn.is_autocommit())
    }

    /// Run a closure with access to this shard on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, ShardError>
    where
        F: FnOnce(&ShardConn) -> Result<R, ShardError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || f(&conn))
            .await
            .map_err(|e| ShardError::Other(anyhow::anyhow!("shard {} task panicked: {}", self.name, e)))?
    }

    /// Whether both handles point at the same underlying connection.
    pub fn same_connection(&self, other: &ShardConn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Tables every shard carries regardless of which updates have run.
fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS shards (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            account_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS shard_map (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            shard_id INTEGER NOT NULL,
            domain TEXT NOT NULL DEFAULT '',
            account_id INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS system_db_updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            update_name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_shard_map_account ON shard_map(account_id);
        ",
    )
}
