//! Multi-shard system update engine.
//!
//! An [`UpdateRegistry`] holds the ordered [`UpdateSpec`]s. The [`Updater`]
//! fans them out to every shard: updates run in order within a shard, shards
//! run concurrently, and each completed update leaves a marker row in
//! `system_db_updates` so later runs skip it.

pub mod descriptor;
pub mod engine;
pub mod registry;

pub use descriptor::{
    DbUpdate, UpdateFn, UpdateInstance, UpdateSpec, UpdateState, create_db_update_by_name,
    fetch_db_update_by_name, list_db_updates,
};
pub use engine::{DbUpdateInfo, RunReport, ShardReport, Updater};
pub use registry::{UpdateRegistry, system_updates};
