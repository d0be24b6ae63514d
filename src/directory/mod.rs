//! Shard directory: which shards exist and which shard owns each tenant.
//!
//! | Module      | Responsibility                                              |
//! |-------------|-------------------------------------------------------------|
//! | `shard`     | `Shard` rows and per-connection lookups                     |
//! | `shard_map` | `ShardMap` routing rows, `assign_account`                   |
//! | `routing`   | account / email → owning shard, rebinding the context       |
//! | `cluster`   | the same change applied to every connection, best-effort    |

pub mod cluster;
pub mod routing;
pub mod shard;
pub mod shard_map;

pub use cluster::{cluster_add_shard, cluster_assign_account, cluster_delete_shard, cluster_get_shards};
pub use routing::{fetch_shard_by_account_id, fetch_shard_by_email};
pub use shard::{Shard, create_shard_by_name, fetch_shard_by_id, fetch_shard_by_name, get_all_shards};
pub use shard_map::{ShardMap, assign_account};
