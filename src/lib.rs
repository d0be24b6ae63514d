//! Shard directory and concurrent system database updater for fleets of
//! SQLite shards.
//!
//! - [`db`]: shard connections, the read-only collection and the execution context
//! - [`directory`]: the `shards` / `shard_map` tables and tenant routing
//! - [`updater`]: ordered, idempotent updates fanned out to every shard
//! - [`config`] and [`logging`]: `shardkit.toml` and the tracing subscriber

pub mod config;
pub mod db;
pub mod directory;
pub mod errors;
pub mod fanout;
pub mod logging;
pub mod updater;

pub use errors::{AggregateError, ShardError};
