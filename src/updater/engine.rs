use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::descriptor::{UpdateSpec, UpdateState, create_db_update_by_name};
use super::registry::UpdateRegistry;
use crate::db::{ConnectionCollection, Context, Executor};
use crate::errors::{AggregateError, ShardError, ShardFailure};
use crate::fanout::{collect, fan_out};

/// What one shard's worker did during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardReport {
    pub shard: String,
    pub dry_run: bool,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// Update that stopped the sequence, if any.
    pub failed: Option<String>,
    pub error: Option<String>,
}

impl ShardReport {
    fn new(shard: &str, dry_run: bool) -> Self {
        Self {
            shard: shard.to_string(),
            dry_run,
            applied: Vec::new(),
            skipped: Vec::new(),
            failed: None,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-shard reports of a run where every shard succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub shards: Vec<ShardReport>,
}

/// Status of one update on one shard, for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbUpdateInfo {
    pub name: String,
    pub description: String,
    pub applied: bool,
    pub applied_at: Option<String>,
}

/// Applies an ordered list of updates to every shard concurrently.
pub struct Updater {
    connections: Arc<ConnectionCollection>,
    registry: Arc<UpdateRegistry>,
}

impl Updater {
    pub fn new(connections: Arc<ConnectionCollection>, registry: UpdateRegistry) -> Self {
        Self {
            connections,
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &UpdateRegistry {
        &self.registry
    }

    /// Run every registered update on every shard.
    ///
    /// Shards run concurrently, each applying updates in registration order
    /// and stopping at its first failure. With `dry_run` each shard's
    /// sequence runs inside a transaction that is always rolled back.
    pub async fn run_all(&self, dry_run: bool) -> Result<RunReport, AggregateError> {
        tracing::info!(
            shards = self.connections.len(),
            updates = self.registry.len(),
            dry_run,
            "running system updates"
        );
        let registry = Arc::clone(&self.registry);
        let outcomes = fan_out(&self.connections, move |ctx| {
            Ok(run_shard(ctx, registry.updates(), dry_run))
        })
        .await;

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            let report = match outcome.result {
                Ok(report) => report,
                Err(e) => {
                    let mut report = ShardReport::new(&outcome.shard, dry_run);
                    report.error = Some(e.to_string());
                    report
                }
            };
            if let Some(message) = &report.error {
                tracing::warn!(shard = %report.shard, error = %message, "shard update failed");
                failures.push(ShardFailure {
                    shard: report.shard.clone(),
                    message: message.clone(),
                });
            }
            reports.push(report);
        }

        if failures.is_empty() {
            Ok(RunReport {
                dry_run,
                shards: reports,
            })
        } else {
            Err(AggregateError::new(failures, reports))
        }
    }

    /// Marker status of every registered update on every shard.
    ///
    /// Never runs an update or writes a marker for one that has not run;
    /// the only write is backfilling a missing description on an existing marker.
    pub async fn db_update_info(
        &self,
    ) -> Result<BTreeMap<String, Vec<DbUpdateInfo>>, AggregateError> {
        let registry = Arc::clone(&self.registry);
        let outcomes = fan_out(&self.connections, move |ctx| {
            registry
                .updates()
                .iter()
                .map(|spec| update_info(&*ctx, spec))
                .collect::<Result<Vec<_>, _>>()
        })
        .await;
        Ok(collect(outcomes)?.into_iter().collect())
    }
}

fn update_info(ctx: &impl Executor, spec: &UpdateSpec) -> Result<DbUpdateInfo, ShardError> {
    let mut marker = create_db_update_by_name(ctx, spec.name())?;
    if marker.is_saved() && marker.description.is_empty() && !spec.description().is_empty() {
        marker.description = spec.description().to_string();
        marker.save(ctx)?;
        tracing::debug!(shard = ctx.shard(), update = spec.name(), "backfilled description");
    }
    let applied = marker.is_saved();
    Ok(DbUpdateInfo {
        name: spec.name().to_string(),
        description: if applied {
            marker.description
        } else {
            spec.description().to_string()
        },
        applied,
        applied_at: applied.then_some(marker.created_at),
    })
}

/// One shard's worker: apply `updates` in order, stopping at the first failure.
fn run_shard(ctx: &mut Context, updates: &[UpdateSpec], dry_run: bool) -> ShardReport {
    let mut report = ShardReport::new(ctx.shard(), dry_run);
    tracing::info!(shard = ctx.shard(), dry_run, "shard worker started");

    if dry_run {
        if let Err(e) = ctx.begin() {
            report.error = Some(e.to_string());
            return report;
        }
    }

    for spec in updates {
        let mut instance = spec.instance();
        match instance.apply(ctx) {
            Ok(UpdateState::Skipped) => report.skipped.push(spec.name().to_string()),
            Ok(_) => {
                tracing::info!(shard = ctx.shard(), update = spec.name(), dry_run, "update applied");
                report.applied.push(spec.name().to_string());
            }
            Err(e) => {
                report.failed = Some(spec.name().to_string());
                report.error = Some(e.to_string());
                break;
            }
        }
    }

    if dry_run {
        if let Err(e) = ctx.rollback() {
            tracing::warn!(shard = ctx.shard(), error = %e, "dry-run rollback failed");
            report.error.get_or_insert_with(|| e.to_string());
        }
    }

    tracing::info!(
        shard = ctx.shard(),
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        ok = report.is_ok(),
        "shard worker finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ShardConn;
    use crate::updater::descriptor::list_db_updates;
    use rusqlite::OptionalExtension;

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

    fn registry() -> UpdateRegistry {
        UpdateRegistry::new()
            .with(UpdateSpec::sql("u1", "first", "CREATE TABLE one (x INTEGER);"))
            .unwrap()
            .with(UpdateSpec::sql("u2", "second", "CREATE TABLE two (x INTEGER);"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_all_applies_in_order_then_skips() -> anyhow::Result<()> {
        let connections = collection(&["a", "b"]);
        let updater = Updater::new(Arc::clone(&connections), registry());

        let report = updater.run_all(false).await?;
        assert_eq!(report.shards.len(), 2);
        for shard in &report.shards {
            assert_eq!(shard.applied, vec!["u1", "u2"]);
            assert!(shard.skipped.is_empty());
        }
        assert_eq!(markers(&connections, "a"), vec!["u1", "u2"]);

        let again = updater.run_all(false).await?;
        for shard in &again.shards {
            assert!(shard.applied.is_empty());
            assert_eq!(shard.skipped, vec!["u1", "u2"]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_leaves_nothing_behind() -> anyhow::Result<()> {
        let connections = collection(&["a"]);
        let updater = Updater::new(Arc::clone(&connections), registry());

        let report = updater.run_all(true).await?;
        assert!(report.dry_run);
        assert_eq!(report.shards[0].applied, vec!["u1", "u2"]);
        assert!(markers(&connections, "a").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_stops_only_that_shard() {
        let connections = collection(&["a", "b"]);
        let registry = UpdateRegistry::new()
            .with(UpdateSpec::sql("u1", "", "SELECT 1;"))
            .unwrap()
            .with(UpdateSpec::new("u2", "", |ctx| {
                if ctx.shard() == "b" {
                    anyhow::bail!("b refuses");
                }
                Ok(())
            }))
            .unwrap()
            .with(UpdateSpec::sql("u3", "", "SELECT 1;"))
            .unwrap();
        let updater = Updater::new(Arc::clone(&connections), registry);

        let err = updater.run_all(false).await.unwrap_err();
        assert_eq!(err.to_string(), "shard b: update u2 failed: b refuses");
        assert_eq!(err.reports.len(), 2);
        let b = err.reports.iter().find(|r| r.shard == "b").unwrap();
        assert_eq!(b.applied, vec!["u1"]);
        assert_eq!(b.failed.as_deref(), Some("u2"));
        assert_eq!(markers(&connections, "a"), vec!["u1", "u2", "u3"]);
        assert_eq!(markers(&connections, "b"), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_panicking_update_fails_its_shard_only() {
        let connections = collection(&["a", "b"]);
        let registry = UpdateRegistry::new()
            .with(UpdateSpec::new("explode", "", |ctx| {
                if ctx.shard() == "a" {
                    panic!("kaboom");
                }
                Ok(())
            }))
            .unwrap();
        let updater = Updater::new(Arc::clone(&connections), registry);

        let err = updater.run_all(false).await.unwrap_err();
        assert_eq!(err.failed_shards(), vec!["a"]);
        assert_eq!(markers(&connections, "b"), vec!["explode"]);

        // The panicked worker's savepoint was rolled back and the connection released.
        assert!(connections.get_by_name("a").unwrap().is_idle().unwrap());
        assert!(markers(&connections, "a").is_empty());
        let follow_up = Updater::new(Arc::clone(&connections), self::registry())
            .run_all(true)
            .await
            .unwrap();
        assert_eq!(follow_up.shards[0].applied, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_panic_during_dry_run_releases_the_shard() -> anyhow::Result<()> {
        let connections = collection(&["a"]);
        let registry = UpdateRegistry::new()
            .with(UpdateSpec::sql("u1", "", "CREATE TABLE one (x INTEGER);"))?
            .with(UpdateSpec::new("explode", "", |_| panic!("kaboom")))?;
        let updater = Updater::new(Arc::clone(&connections), registry);

        assert!(updater.run_all(true).await.is_err());

        let shard = connections.get_by_name("a")?;
        assert!(shard.is_idle()?);
        let one: Option<i64> = shard.with_conn(|c| {
            c.query_row("SELECT 1 FROM sqlite_master WHERE name = 'one'", [], |r| r.get(0))
                .optional()
        })?;
        assert!(one.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_db_update_info_reports_without_running() -> anyhow::Result<()> {
        let connections = collection(&["a", "b"]);
        let updater = Updater::new(Arc::clone(&connections), registry());

        let info = updater.db_update_info().await?;
        assert_eq!(info.len(), 2);
        assert!(info["a"].iter().all(|i| !i.applied && i.applied_at.is_none()));
        assert!(markers(&connections, "a").is_empty());

        updater.run_all(false).await?;
        let info = updater.db_update_info().await?;
        assert!(info["b"].iter().all(|i| i.applied && i.applied_at.is_some()));
        Ok(())
    }

    #[tokio::test]
    async fn test_db_update_info_backfills_missing_description() -> anyhow::Result<()> {
        let connections = collection(&["a"]);
        connections.get_by_name("a")?.with_conn(|c| {
            c.execute("INSERT INTO system_db_updates (update_name) VALUES ('u1')", [])
        })?;
        let updater = Updater::new(Arc::clone(&connections), registry());

        let info = updater.db_update_info().await?;
        assert_eq!(info["a"][0].description, "first");
        assert!(!info["a"][1].applied);

        let ctx = connections.new_session("a")?;
        let stored = list_db_updates(&ctx)?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].description, "first");
        Ok(())
    }
}
