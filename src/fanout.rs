//! Run one task per shard connection, concurrently, and collect every outcome.
//!
//! Each task gets its own [`Context`] bound to its shard and runs on tokio's
//! blocking pool. Tasks share nothing but the read-only collection, and a
//! failure or panic in one never stops the others.

use std::sync::Arc;

use futures::future::join_all;

use crate::db::{ConnectionCollection, Context};
use crate::errors::{AggregateError, ShardError, ShardFailure};

/// Result of one shard's task.
#[derive(Debug)]
pub struct ShardOutcome<T> {
    pub shard: String,
    pub result: Result<T, ShardError>,
}

/// Run `task` once per connection and wait for all of them.
///
/// Outcomes come back sorted by shard name.
pub async fn fan_out<T, F>(connections: &Arc<ConnectionCollection>, task: F) -> Vec<ShardOutcome<T>>
where
    F: Fn(&mut Context) -> Result<T, ShardError> + Send + Sync + 'static,
    T: Send + 'static,
{
    let task = Arc::new(task);

    let workers: Vec<_> = connections
        .get_all()
        .values()
        .map(|conn| {
            let shard = conn.name().to_string();
            let mut ctx = Context::new(Arc::clone(connections), conn.clone());
            let task = Arc::clone(&task);
            let handle = tokio::task::spawn_blocking(move || task(&mut ctx));
            async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(ShardError::Other(anyhow::anyhow!("worker panicked: {}", e))),
                };
                ShardOutcome { shard, result }
            }
        })
        .collect();

    let mut outcomes = join_all(workers).await;
    outcomes.sort_by(|a, b| a.shard.cmp(&b.shard));
    outcomes
}

/// Split outcomes into per-shard values and an aggregate of the failures.
pub fn partition<T>(outcomes: Vec<ShardOutcome<T>>) -> (Vec<(String, T)>, Vec<ShardFailure>) {
    let mut values = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(value) => values.push((outcome.shard, value)),
            Err(e) => {
                tracing::warn!(shard = %outcome.shard, error = %e, "shard task failed");
                failures.push(ShardFailure {
                    shard: outcome.shard,
                    message: e.to_string(),
                });
            }
        }
    }
    (values, failures)
}

/// Collapse outcomes into the values, or an [`AggregateError`] naming every failed shard.
pub fn collect<T>(outcomes: Vec<ShardOutcome<T>>) -> Result<Vec<(String, T)>, AggregateError> {
    let (values, failures) = partition(outcomes);
    if failures.is_empty() {
        Ok(values)
    } else {
        Err(AggregateError::new(failures, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Executor, ShardConn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collection(names: &[&str]) -> Arc<ConnectionCollection> {
        let conns = names
            .iter()
            .map(|n| ShardConn::open_in_memory(n).unwrap())
            .collect();
        Arc::new(ConnectionCollection::from_connections(conns).unwrap())
    }

    #[tokio::test]
    async fn test_fan_out_visits_every_shard_once() {
        let connections = collection(&["c", "a", "b"]);
        let visits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&visits);
        let outcomes = fan_out(&connections, move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.shard().to_string())
        })
        .await;

        assert_eq!(visits.load(Ordering::SeqCst), 3);
        let shards: Vec<_> = outcomes.iter().map(|o| o.shard.as_str()).collect();
        assert_eq!(shards, vec!["a", "b", "c"]);
        for outcome in &outcomes {
            assert_eq!(outcome.result.as_ref().unwrap(), &outcome.shard);
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_siblings() {
        let connections = collection(&["a", "b", "c"]);
        let outcomes = fan_out(&connections, |ctx| {
            if ctx.shard() == "b" {
                return Err(ShardError::Other(anyhow::anyhow!("b is down")));
            }
            Ok(())
        })
        .await;

        let err = collect(outcomes).unwrap_err();
        assert_eq!(err.failed_shards(), vec!["b"]);
        assert_eq!(err.to_string(), "shard b: b is down");
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failure() {
        let connections = collection(&["a", "b"]);
        let outcomes = fan_out(&connections, |ctx| {
            if ctx.shard() == "a" {
                panic!("boom");
            }
            Ok(1)
        })
        .await;

        let (values, failures) = partition(outcomes);
        assert_eq!(values, vec![("b".to_string(), 1)]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].shard, "a");
        assert!(failures[0].message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_empty_collection_yields_no_outcomes() {
        let connections = Arc::new(ConnectionCollection::default());
        let outcomes = fan_out(&connections, |_| Ok(())).await;
        assert!(outcomes.is_empty());
        assert!(collect(outcomes).unwrap().is_empty());
    }
}
