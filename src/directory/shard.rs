use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};

use crate::db::Executor;
use crate::errors::ShardError;

/// A shard as recorded in one connection's `shards` table.
///
/// Each database keeps its own copy of the fleet's shard list, so ids are
/// only meaningful within the connection the row was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: i64,
    pub name: String,
    pub account_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

pub(crate) const SHARD_COLUMNS: &str = "id, name, account_count, created_at, updated_at, deleted_at";

impl Shard {
    /// An unsaved shard with no accounts.
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            account_count: 0,
            created_at: String::new(),
            updated_at: String::new(),
            deleted_at: None,
        }
    }

    pub fn is_saved(&self) -> bool {
        self.id > 0
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            account_count: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            deleted_at: row.get(5)?,
        })
    }

    /// Insert the shard if it has never been saved, update it otherwise.
    pub fn save(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        if self.is_saved() {
            ctx.execute(
                "UPDATE shards SET name = ?1, account_count = ?2, deleted_at = ?3, updated_at = datetime('now')
                 WHERE id = ?4",
                params![self.name, self.account_count, self.deleted_at, self.id],
            )?;
        } else {
            let id = ctx.query_opt(
                "INSERT INTO shards (name, account_count, deleted_at) VALUES (?1, ?2, ?3) RETURNING id",
                params![self.name, self.account_count, self.deleted_at],
                |r| r.get::<_, i64>(0),
            )?;
            self.id = id.ok_or_else(|| {
                ShardError::Other(anyhow::anyhow!("insert into shards returned no id on shard {}", ctx.shard()))
            })?;
        }
        self.reload(ctx)
    }

    /// Mark the shard deleted. Rows are never removed.
    pub fn soft_delete(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        ctx.execute(
            "UPDATE shards SET deleted_at = datetime('now'), updated_at = datetime('now') WHERE id = ?1",
            params![self.id],
        )?;
        self.reload(ctx)
    }

    /// Clear a soft delete.
    pub fn restore(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        ctx.execute(
            "UPDATE shards SET deleted_at = NULL, updated_at = datetime('now') WHERE id = ?1",
            params![self.id],
        )?;
        self.reload(ctx)
    }

    /// Adjust `account_count` by `delta` in the database and in memory.
    pub fn add_accounts(&mut self, ctx: &impl Executor, delta: i64) -> Result<(), ShardError> {
        ctx.execute(
            "UPDATE shards SET account_count = MAX(account_count + ?1, 0), updated_at = datetime('now')
             WHERE id = ?2",
            params![delta, self.id],
        )?;
        self.reload(ctx)
    }

    fn reload(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        let sql = format!("SELECT {SHARD_COLUMNS} FROM shards WHERE id = ?1");
        match ctx.query_opt(&sql, params![self.id], Shard::from_row)? {
            Some(fresh) => {
                *self = fresh;
                Ok(())
            }
            None => Err(ShardError::NotFound {
                name: self.name.clone(),
            }),
        }
    }
}

/// Live shard with the given id, if any.
pub fn fetch_shard_by_id(ctx: &impl Executor, id: i64) -> Result<Option<Shard>, ShardError> {
    let sql = format!("SELECT {SHARD_COLUMNS} FROM shards WHERE id = ?1 AND deleted_at IS NULL");
    ctx.query_opt(&sql, params![id], Shard::from_row)
}

/// Live shard with the given name, if any.
pub fn fetch_shard_by_name(ctx: &impl Executor, name: &str) -> Result<Option<Shard>, ShardError> {
    let sql = format!("SELECT {SHARD_COLUMNS} FROM shards WHERE name = ?1 AND deleted_at IS NULL");
    ctx.query_opt(&sql, params![name], Shard::from_row)
}

/// Every live shard, oldest first.
pub fn get_all_shards(ctx: &impl Executor) -> Result<Vec<Shard>, ShardError> {
    let sql = format!("SELECT {SHARD_COLUMNS} FROM shards WHERE deleted_at IS NULL ORDER BY id");
    ctx.query(&sql, params![], Shard::from_row)
}

/// Fetch-or-create: the stored row named `name` (soft-deleted rows included,
/// so they can be restored rather than duplicated), otherwise an unsaved
/// shard the caller must still [`Shard::save`].
pub fn create_shard_by_name(ctx: &impl Executor, name: &str) -> Result<Shard, ShardError> {
    let sql = format!("SELECT {SHARD_COLUMNS} FROM shards WHERE name = ?1");
    Ok(ctx
        .query_opt(&sql, params![name], Shard::from_row)?
        .unwrap_or_else(|| Shard::new(name)))
}
