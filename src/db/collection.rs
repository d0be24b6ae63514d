use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;

use super::connection::ShardConn;
use super::context::Context;
use crate::config::ShardConfig;
use crate::errors::ShardError;

/// Read-only registry of every shard connection, keyed by shard name.
///
/// Built once at startup and shared behind an `Arc`; nothing mutates it
/// afterwards, so concurrent workers read it without locking.
#[derive(Debug, Default)]
pub struct ConnectionCollection {
    by_name: HashMap<String, ShardConn>,
    names: Vec<String>,
}

impl ConnectionCollection {
    /// Open one connection per configured shard.
    ///
    /// Fails with [`ShardError::Config`] when the list is empty, a name repeats,
    /// or any shard cannot be opened.
    pub fn open(configs: &[ShardConfig]) -> Result<Self, ShardError> {
        if configs.is_empty() {
            return Err(ShardError::Config(
                "at least one shard must be configured".to_string(),
            ));
        }
        let mut conns = Vec::with_capacity(configs.len());
        for config in configs {
            if config.name.trim().is_empty() {
                return Err(ShardError::Config("shard name must not be empty".to_string()));
            }
            conns.push(ShardConn::open(config)?);
        }
        Self::from_connections(conns)
    }

    /// Build a collection from already-open connections.
    pub fn from_connections(conns: Vec<ShardConn>) -> Result<Self, ShardError> {
        let mut collection = Self::default();
        for conn in conns {
            let name = conn.name().to_string();
            if collection.by_name.contains_key(&name) {
                return Err(ShardError::Config(format!("duplicate shard name '{}'", name)));
            }
            collection.names.push(name.clone());
            collection.by_name.insert(name, conn);
        }
        collection.names.sort();
        Ok(collection)
    }

    /// Look up a connection by shard name.
    pub fn get_by_name(&self, name: &str) -> Result<ShardConn, ShardError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ShardError::NotFound {
                name: name.to_string(),
            })
    }

    /// Pick any connection, uniformly at random.
    ///
    /// Only meaningful for data mirrored to every shard, such as the shard map.
    pub fn get_random(&self) -> Result<ShardConn, ShardError> {
        let name = self
            .names
            .choose(&mut rand::thread_rng())
            .ok_or(ShardError::Empty)?;
        self.get_by_name(name)
    }

    /// Every connection keyed by name. Iteration order is unspecified.
    pub fn get_all(&self) -> &HashMap<String, ShardConn> {
        &self.by_name
    }

    /// Resolve `name` and bind a fresh context to it.
    pub fn new_session(self: &Arc<Self>, name: &str) -> Result<Context, ShardError> {
        let conn = self.get_by_name(name)?;
        Ok(Context::new(Arc::clone(self), conn))
    }

    /// Shard names in sorted order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
