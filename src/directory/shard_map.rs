use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};

use super::shard::{Shard, fetch_shard_by_id, fetch_shard_by_name};
use crate::db::{Context, Executor};
use crate::errors::ShardError;

/// Routing row: which shard owns `account_id`, and the email domain used to
/// route before the account is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMap {
    pub id: i64,
    pub shard_id: i64,
    pub domain: String,
    pub account_id: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

const MAP_COLUMNS: &str = "id, shard_id, domain, account_id, created_at, updated_at, deleted_at";

impl ShardMap {
    pub fn new(shard_id: i64, domain: &str, account_id: i64) -> Self {
        Self {
            id: 0,
            shard_id,
            domain: normalize_domain(domain),
            account_id,
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

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            shard_id: row.get(1)?,
            domain: row.get(2)?,
            account_id: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            deleted_at: row.get(6)?,
        })
    }

    pub fn save(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        if self.is_saved() {
            ctx.execute(
                "UPDATE shard_map SET shard_id = ?1, domain = ?2, account_id = ?3, deleted_at = ?4,
                 updated_at = datetime('now') WHERE id = ?5",
                params![self.shard_id, self.domain, self.account_id, self.deleted_at, self.id],
            )?;
        } else {
            let id = ctx.query_opt(
                "INSERT INTO shard_map (shard_id, domain, account_id, deleted_at) VALUES (?1, ?2, ?3, ?4) RETURNING id",
                params![self.shard_id, self.domain, self.account_id, self.deleted_at],
                |r| r.get::<_, i64>(0),
            )?;
            self.id = id.ok_or_else(|| {
                ShardError::Other(anyhow::anyhow!("insert into shard_map returned no id on shard {}", ctx.shard()))
            })?;
        }
        self.reload(ctx)
    }

    pub fn soft_delete(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        ctx.execute(
            "UPDATE shard_map SET deleted_at = datetime('now'), updated_at = datetime('now') WHERE id = ?1",
            params![self.id],
        )?;
        self.reload(ctx)
    }

    pub fn undelete(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        ctx.execute(
            "UPDATE shard_map SET deleted_at = NULL, updated_at = datetime('now') WHERE id = ?1",
            params![self.id],
        )?;
        self.reload(ctx)
    }

    fn reload(&mut self, ctx: &impl Executor) -> Result<(), ShardError> {
        let sql = format!("SELECT {MAP_COLUMNS} FROM shard_map WHERE id = ?1");
        match ctx.query_opt(&sql, params![self.id], ShardMap::from_row)? {
            Some(fresh) => {
                *self = fresh;
                Ok(())
            }
            None => Err(ShardError::Other(anyhow::anyhow!(
                "shard_map row {} vanished on shard {}",
                self.id,
                ctx.shard()
            ))),
        }
    }
}

/// Lower-cased, trimmed domain as stored in `shard_map.domain`.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().to_lowercase()
}

/// Domain part of an email address, or `None` when there isn't one.
pub fn domain_of(email: &str) -> Option<String> {
    let (local, domain) = email.trim().rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(normalize_domain(domain))
}

/// Live map row for the account; the newest wins if several exist.
pub fn fetch_by_account_id(
    ctx: &impl Executor,
    account_id: i64,
) -> Result<Option<ShardMap>, ShardError> {
    let sql = format!(
        "SELECT {MAP_COLUMNS} FROM shard_map WHERE account_id = ?1 AND deleted_at IS NULL
         ORDER BY id DESC LIMIT 1"
    );
    ctx.query_opt(&sql, params![account_id], ShardMap::from_row)
}

/// Oldest live map row for the domain.
pub fn fetch_by_domain(ctx: &impl Executor, domain: &str) -> Result<Option<ShardMap>, ShardError> {
    let sql = format!(
        "SELECT {MAP_COLUMNS} FROM shard_map WHERE domain = ?1 AND deleted_at IS NULL
         ORDER BY id LIMIT 1"
    );
    ctx.query_opt(&sql, params![normalize_domain(domain)], ShardMap::from_row)
}

/// Every live map row pointing at `shard_id`.
pub fn list_for_shard(ctx: &impl Executor, shard_id: i64) -> Result<Vec<ShardMap>, ShardError> {
    let sql = format!(
        "SELECT {MAP_COLUMNS} FROM shard_map WHERE shard_id = ?1 AND deleted_at IS NULL ORDER BY id"
    );
    ctx.query(&sql, params![shard_id], ShardMap::from_row)
}

/// Route `account_id` (and its `domain`) to the live shard named `shard_name`.
///
/// A previous live mapping to a different shard is soft-deleted and that
/// shard's account count decremented. Reassigning to the same shard only
/// refreshes the domain. Runs in a savepoint so the counters and the map
/// never disagree.
pub fn assign_account(
    ctx: &mut Context,
    shard_name: &str,
    domain: &str,
    account_id: i64,
) -> Result<ShardMap, ShardError> {
    ctx.savepoint(|ctx| {
        let ctx = &*ctx;
        let mut shard: Shard =
            fetch_shard_by_name(ctx, shard_name)?.ok_or_else(|| ShardError::NotFound {
                name: shard_name.to_string(),
            })?;

        if let Some(mut existing) = fetch_by_account_id(ctx, account_id)? {
            if existing.shard_id == shard.id {
                existing.domain = normalize_domain(domain);
                existing.save(ctx)?;
                return Ok(existing);
            }
            existing.soft_delete(ctx)?;
            if let Some(mut previous) = fetch_shard_by_id(ctx, existing.shard_id)? {
                previous.add_accounts(ctx, -1)?;
            }
        }

        let mut map = ShardMap::new(shard.id, domain, account_id);
        map.save(ctx)?;
        shard.add_accounts(ctx, 1)?;
        Ok(map)
    })
}
