//! End-to-end updater and directory behaviour across several shards.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use shardkit::db::{ConnectionCollection, Executor, ShardConn};
use shardkit::directory::{cluster_add_shard, cluster_get_shards};
use shardkit::updater::{UpdateRegistry, UpdateSpec, Updater, list_db_updates, system_updates};
use shardkit::ShardError;

fn collection(names: &[&str]) -> Arc<ConnectionCollection> {
    let conns = names
        .iter()
        .map(|n| ShardConn::open_in_memory(n).unwrap())
        .collect();
    Arc::new(ConnectionCollection::from_connections(conns).unwrap())
}

fn markers(connections: &Arc<ConnectionCollection>, shard: &str) -> Vec<String> {
    let ctx = connections.new_session(shard).unwrap();
    list_db_updates(&ctx)
        .unwrap()
        .into_iter()
        .map(|m| m.update_name)
        .collect()
}

/// `[U1, U2]` where U2 fails only on shard B.
fn u2_fails_on_b() -> UpdateRegistry {
    UpdateRegistry::new()
        .with(UpdateSpec::sql("U1", "creates widgets", "CREATE TABLE widgets (id INTEGER);"))
        .unwrap()
        .with(UpdateSpec::new("U2", "fills widgets", |ctx| {
            ctx.execute("INSERT INTO widgets (id) VALUES (1)", params![])?;
            if ctx.shard() == "B" {
                anyhow::bail!("constraint violated on B");
            }
            Ok(())
        }))
        .unwrap()
}

mod run_all {
    use super::*;

    #[tokio::test]
    async fn test_successful_run_marks_every_update_in_order() -> anyhow::Result<()> {
        let connections = collection(&["A", "B", "C"]);
        let updater = Updater::new(Arc::clone(&connections), system_updates()?);
        updater.run_all(false).await?;

        let expected: Vec<String> = updater
            .registry()
            .names()
            .into_iter()
            .map(String::from)
            .collect();
        for shard in ["A", "B", "C"] {
            assert_eq!(markers(&connections, shard), expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() -> anyhow::Result<()> {
        let connections = collection(&["A", "B"]);
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let registry = UpdateRegistry::new().with(UpdateSpec::new("count", "", move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }))?;
        let updater = Updater::new(Arc::clone(&connections), registry);

        updater.run_all(false).await?;
        let second = updater.run_all(false).await?;

        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 2);
        for report in &second.shards {
            assert!(report.applied.is_empty());
            assert_eq!(report.skipped, vec!["count"]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_never_leaves_markers() -> anyhow::Result<()> {
        let connections = collection(&["A", "B", "C"]);

        Updater::new(Arc::clone(&connections), system_updates()?)
            .run_all(true)
            .await?;
        let failing = Updater::new(Arc::clone(&connections), u2_fails_on_b())
            .run_all(true)
            .await;
        assert!(failing.is_err());

        for shard in ["A", "B", "C"] {
            assert!(markers(&connections, shard).is_empty());
            let ctx = connections.new_session(shard)?;
            let widgets: Option<i64> = ctx.query_opt(
                "SELECT 1 FROM sqlite_master WHERE name = 'widgets'",
                params![],
                |r| r.get(0),
            )?;
            assert!(widgets.is_none());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_on_one_shard_is_isolated() {
        let connections = collection(&["A", "B", "C"]);
        let updater = Updater::new(Arc::clone(&connections), u2_fails_on_b());

        let err = updater.run_all(false).await.unwrap_err();

        let text = err.to_string();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("shard B"));
        assert!(text.contains("U2"));
        assert_eq!(err.failed_shards(), vec!["B"]);

        assert_eq!(markers(&connections, "A"), vec!["U1", "U2"]);
        assert_eq!(markers(&connections, "B"), vec!["U1"]);
        assert_eq!(markers(&connections, "C"), vec!["U1", "U2"]);

        // U2's partial insert on B was rolled back with it.
        let ctx = connections.new_session("B").unwrap();
        let rows: Option<i64> = ctx
            .query_opt("SELECT COUNT(*) FROM widgets", params![], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, Some(0));
    }

    #[tokio::test]
    async fn test_rerun_after_fix_applies_only_the_rest() -> anyhow::Result<()> {
        let connections = collection(&["A", "B"]);
        let _ = Updater::new(Arc::clone(&connections), u2_fails_on_b())
            .run_all(false)
            .await;

        let fixed = UpdateRegistry::new()
            .with(UpdateSpec::sql("U1", "", "SELECT 1;"))?
            .with(UpdateSpec::sql("U2", "", "INSERT INTO widgets (id) VALUES (2);"))?;
        let report = Updater::new(Arc::clone(&connections), fixed)
            .run_all(false)
            .await?;

        let b = report.shards.iter().find(|r| r.shard == "B").unwrap();
        assert_eq!(b.skipped, vec!["U1"]);
        assert_eq!(b.applied, vec!["U2"]);
        let a = report.shards.iter().find(|r| r.shard == "A").unwrap();
        assert_eq!(a.skipped, vec!["U1", "U2"]);
        Ok(())
    }
}

mod directory {
    use super::*;

    #[tokio::test]
    async fn test_add_shard_with_one_failing_connection() -> anyhow::Result<()> {
        let connections = collection(&["A", "B", "C"]);
        connections.get_by_name("C")?.with_conn(|c| {
            c.execute_batch(
                "CREATE TRIGGER no_inserts BEFORE INSERT ON shards
                 BEGIN SELECT RAISE(ABORT, 'read only'); END;",
            )
        })?;

        let err = cluster_add_shard(&connections, "D").await.unwrap_err();
        assert_eq!(err.failed_shards(), vec!["C"]);

        let by_conn = cluster_get_shards(&connections).await?;
        for conn in ["A", "B"] {
            let names: Vec<_> = by_conn[conn].iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["D"]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_add_shard_during_dry_run_is_kept() -> anyhow::Result<()> {
        let connections = collection(&["A", "B"]);
        let slow = UpdateRegistry::new().with(UpdateSpec::new("slow", "", |ctx| {
            ctx.execute("INSERT INTO shards (name) VALUES ('rehearsal')", params![])?;
            std::thread::sleep(Duration::from_millis(150));
            Ok(())
        }))?;
        let updater = Updater::new(Arc::clone(&connections), slow);

        let (dry, added) = tokio::join!(updater.run_all(true), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cluster_add_shard(&connections, "D").await
        });
        dry?;
        added?;

        // The add waited for the dry run to roll back instead of landing inside it.
        let by_conn = cluster_get_shards(&connections).await?;
        for conn in ["A", "B"] {
            let names: Vec<_> = by_conn[conn].iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["D"]);
        }
        Ok(())
    }
}

mod random_lookup {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_get_random_on_empty_collection() {
        let empty = ConnectionCollection::default();
        assert!(matches!(empty.get_random(), Err(ShardError::Empty)));
    }

    #[test]
    fn test_get_random_eventually_returns_every_shard() {
        let connections = collection(&["A", "B", "C"]);
        let mut seen = HashSet::new();
        for _ in 0..500 {
            seen.insert(connections.get_random().unwrap().name().to_string());
            if seen.len() == 3 {
                break;
            }
        }
        assert_eq!(seen.len(), 3);
    }
}
