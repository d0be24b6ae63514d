use std::sync::Arc;

use rusqlite::ToSql;

use super::shard::{SHARD_COLUMNS, Shard};
use super::shard_map::domain_of;
use crate::db::{Context, Executor};
use crate::errors::ShardError;

/// Resolve the shard that owns `account_id` and rebind `ctx` to it.
///
/// The shard map is mirrored to every shard, so the lookup runs on whichever
/// connection [`crate::db::ConnectionCollection::get_random`] returns. On a
/// hit, `ctx`'s active session is switched to the owning shard's connection.
pub fn fetch_shard_by_account_id(
    ctx: &mut Context,
    account_id: i64,
) -> Result<Option<Shard>, ShardError> {
    let sql = format!(
        "SELECT {} FROM shard_map m JOIN shards s ON s.id = m.shard_id
         WHERE m.account_id = ?1 AND m.deleted_at IS NULL AND s.deleted_at IS NULL
         ORDER BY m.id DESC LIMIT 1",
        qualified_shard_columns()
    );
    let shard = lookup(ctx, &sql, &account_id)?;
    tracing::debug!(account_id, shard = shard.as_ref().map(|s| s.name.as_str()), "routed account");
    bind_to(ctx, shard)
}

/// Resolve the shard that owns `email`'s domain and rebind `ctx` to it.
///
/// An address without a domain resolves to `None`.
pub fn fetch_shard_by_email(ctx: &mut Context, email: &str) -> Result<Option<Shard>, ShardError> {
    let Some(domain) = domain_of(email) else {
        tracing::debug!(email, "email has no domain; nothing to route");
        return Ok(None);
    };
    let sql = format!(
        "SELECT {} FROM shard_map m JOIN shards s ON s.id = m.shard_id
         WHERE m.domain = ?1 AND m.deleted_at IS NULL AND s.deleted_at IS NULL
         ORDER BY m.id LIMIT 1",
        qualified_shard_columns()
    );
    let shard = lookup(ctx, &sql, &domain)?;
    tracing::debug!(domain = %domain, shard = shard.as_ref().map(|s| s.name.as_str()), "routed email");
    bind_to(ctx, shard)
}

fn qualified_shard_columns() -> String {
    SHARD_COLUMNS
        .split(", ")
        .map(|c| format!("s.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Runs on a fresh context, which would wait forever on a connection held by
/// the caller's open transaction.
fn lookup(ctx: &Context, sql: &str, key: &dyn ToSql) -> Result<Option<Shard>, ShardError> {
    if ctx.in_transaction() {
        return Err(ShardError::transaction(
            ctx.shard(),
            "route",
            "cannot route a tenant inside an open transaction",
        ));
    }
    let connections = Arc::clone(ctx.connections());
    let directory = Context::new(connections.clone(), connections.get_random()?);
    directory.query_opt(sql, &[key], Shard::from_row)
}

fn bind_to(ctx: &mut Context, shard: Option<Shard>) -> Result<Option<Shard>, ShardError> {
    let Some(shard) = shard else {
        return Ok(None);
    };
    let session = ctx.connections().get_by_name(&shard.name)?;
    ctx.rebind(session)?;
    Ok(Some(shard))
}
