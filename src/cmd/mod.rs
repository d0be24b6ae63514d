//! CLI command implementations.
//!
//! | Module    | Commands handled            |
//! |-----------|-----------------------------|
//! | `update`  | `Update`, `Info`            |
//! | `shards`  | `Shards`, `Route`, `Assign` |
//! | `config`  | `Config`                    |

pub mod config;
pub mod shards;
pub mod update;

pub use config::cmd_config;
pub use shards::{cmd_assign, cmd_route, cmd_shards};
pub use update::{cmd_info, cmd_update};
