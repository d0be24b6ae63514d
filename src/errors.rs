//! Typed error hierarchy for shardkit.
//!
//! Two top-level types cover the library:
//! - `ShardError`: a single failure against one shard or the configuration
//! - `AggregateError`: the merged outcome of a fan-out over every shard

use std::fmt;

use thiserror::Error;

use crate::updater::ShardReport;

/// Errors from a single shard operation, connection lookup or configuration load.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("Invalid shard configuration: {0}")]
    Config(String),

    #[error("Shard connection '{name}' not found")]
    NotFound { name: String },

    #[error("No shard connections registered")]
    Empty,

    #[error("update {update} failed: {source:#}")]
    UpdateFailed {
        update: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Transaction {op} failed on shard {shard}: {message}")]
    Transaction {
        shard: String,
        op: &'static str,
        message: String,
    },

    #[error("Database error on shard {shard}: {source}")]
    Database {
        shard: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Connection for shard {0} poisoned")]
    LockPoisoned(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShardError {
    pub(crate) fn database(shard: &str, source: rusqlite::Error) -> Self {
        Self::Database {
            shard: shard.to_string(),
            source,
        }
    }

    pub(crate) fn transaction(shard: &str, op: &'static str, message: impl fmt::Display) -> Self {
        Self::Transaction {
            shard: shard.to_string(),
            op,
            message: message.to_string(),
        }
    }
}

/// One failed shard inside an [`AggregateError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub shard: String,
    pub message: String,
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // One failure per line, whatever the underlying error printed.
        let message = self.message.replace('\n', " ");
        write!(f, "shard {}: {}", self.shard, message)
    }
}

/// Merged failures from a fan-out across every shard connection.
///
/// The text form is one line per failed shard, sorted by shard name.
/// `reports` carries whatever per-shard progress was made, including the
/// shards that succeeded.
#[derive(Debug)]
pub struct AggregateError {
    pub failures: Vec<ShardFailure>,
    pub reports: Vec<ShardReport>,
}

impl AggregateError {
    pub fn new(mut failures: Vec<ShardFailure>, reports: Vec<ShardReport>) -> Self {
        failures.sort_by(|a, b| a.shard.cmp(&b.shard));
        Self { failures, reports }
    }

    /// Names of every shard that failed, in report order.
    pub fn failed_shards(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.shard.as_str()).collect()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

impl std::error::Error for AggregateError {}
