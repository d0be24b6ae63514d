//! Fleet-wide directory operations.
//!
//! Every connection keeps its own mirror of the shard list and shard map, so
//! these apply the same change to each one. They are best-effort: every
//! connection is always attempted, and the error names each one that failed.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::shard::{Shard, create_shard_by_name, fetch_shard_by_name, get_all_shards};
use super::shard_map::assign_account;
use crate::db::ConnectionCollection;
use crate::errors::{AggregateError, ShardError};
use crate::fanout::{collect, fan_out};

/// Live shard list as seen by each connection, keyed by connection name.
pub async fn cluster_get_shards(
    connections: &Arc<ConnectionCollection>,
) -> Result<BTreeMap<String, Vec<Shard>>, AggregateError> {
    let outcomes = fan_out(connections, |ctx| get_all_shards(&*ctx)).await;
    Ok(collect(outcomes)?.into_iter().collect())
}

/// Create (or revive) the shard named `name` on every connection.
pub async fn cluster_add_shard(
    connections: &Arc<ConnectionCollection>,
    name: &str,
) -> Result<(), AggregateError> {
    let name = name.to_string();
    let outcomes = fan_out(connections, move |ctx| {
        let ctx = &*ctx;
        let mut shard = create_shard_by_name(ctx, &name)?;
        if !shard.is_saved() {
            shard.save(ctx)?;
        } else if shard.is_deleted() {
            shard.restore(ctx)?;
        }
        tracing::info!(shard = ctx.session().name(), added = %name, "shard registered");
        Ok(())
    })
    .await;
    collect(outcomes).map(|_| ())
}

/// Soft-delete the shard named `name` on every connection.
///
/// A connection that has no live shard of that name counts as a failure.
pub async fn cluster_delete_shard(
    connections: &Arc<ConnectionCollection>,
    name: &str,
) -> Result<(), AggregateError> {
    let name = name.to_string();
    let outcomes = fan_out(connections, move |ctx| {
        let ctx = &*ctx;
        let mut shard = fetch_shard_by_name(ctx, &name)?.ok_or_else(|| ShardError::NotFound {
            name: name.clone(),
        })?;
        shard.soft_delete(ctx)?;
        tracing::info!(shard = ctx.session().name(), deleted = %name, "shard retired");
        Ok(())
    })
    .await;
    collect(outcomes).map(|_| ())
}

/// Mirror an account → shard assignment to every connection.
pub async fn cluster_assign_account(
    connections: &Arc<ConnectionCollection>,
    shard_name: &str,
    domain: &str,
    account_id: i64,
) -> Result<(), AggregateError> {
    let shard_name = shard_name.to_string();
    let domain = domain.to_string();
    let outcomes = fan_out(connections, move |ctx| {
        assign_account(ctx, &shard_name, &domain, account_id).map(|_| ())
    })
    .await;
    collect(outcomes).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Executor, ShardConn};

    fn collection(names: &[&str]) -> Arc<ConnectionCollection> {
        let conns = names
            .iter()
            .map(|n| ShardConn::open_in_memory(n).unwrap())
            .collect();
        Arc::new(ConnectionCollection::from_connections(conns).unwrap())
    }

    fn shard_names(shards: &[Shard]) -> Vec<&str> {
        shards.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_add_shard_everywhere() -> anyhow::Result<()> {
        let connections = collection(&["a", "b", "c"]);
        cluster_add_shard(&connections, "new-shard").await?;
        cluster_add_shard(&connections, "new-shard").await?;

        let by_conn = cluster_get_shards(&connections).await?;
        assert_eq!(by_conn.len(), 3);
        for shards in by_conn.values() {
            assert_eq!(shard_names(shards), vec!["new-shard"]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_add_shard_isolates_one_failing_connection() -> anyhow::Result<()> {
        let connections = collection(&["a", "b", "c"]);
        connections.get_by_name("b")?.with_conn(|c| {
            c.execute_batch(
                "CREATE TRIGGER refuse_shards BEFORE INSERT ON shards
                 BEGIN SELECT RAISE(ABORT, 'shards table is frozen'); END;",
            )
        })?;

        let err = cluster_add_shard(&connections, "s9").await.unwrap_err();
        assert_eq!(err.failed_shards(), vec!["b"]);
        assert_eq!(err.to_string().lines().count(), 1);
        assert!(err.to_string().contains("shards table is frozen"));

        let by_conn = cluster_get_shards(&connections).await?;
        assert_eq!(shard_names(&by_conn["a"]), vec!["s9"]);
        assert!(by_conn["b"].is_empty());
        assert_eq!(shard_names(&by_conn["c"]), vec!["s9"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_then_readd_revives_row() -> anyhow::Result<()> {
        let connections = collection(&["a", "b"]);
        cluster_add_shard(&connections, "s1").await?;
        let before = cluster_get_shards(&connections).await?;
        cluster_delete_shard(&connections, "s1").await?;

        for shards in cluster_get_shards(&connections).await?.values() {
            assert!(shards.is_empty());
        }

        cluster_add_shard(&connections, "s1").await?;
        let after = cluster_get_shards(&connections).await?;
        assert_eq!(after["a"][0].id, before["a"][0].id);
        assert!(!after["b"][0].is_deleted());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_shard_reports_every_connection() {
        let connections = collection(&["a", "b"]);
        let err = cluster_delete_shard(&connections, "ghost").await.unwrap_err();
        assert_eq!(err.failed_shards(), vec!["a", "b"]);
        assert_eq!(err.to_string().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_assign_account_is_mirrored() -> anyhow::Result<()> {
        let connections = collection(&["a", "b"]);
        cluster_add_shard(&connections, "b").await?;
        cluster_assign_account(&connections, "b", "acme.io", 9).await?;

        for name in ["a", "b"] {
            let ctx = connections.new_session(name)?;
            let mapped: Option<i64> = ctx.query_opt(
                "SELECT account_id FROM shard_map WHERE domain = 'acme.io'",
                &[],
                |r| r.get(0),
            )?;
            assert_eq!(mapped, Some(9));
        }
        Ok(())
    }
}
