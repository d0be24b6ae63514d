//! Shard connections and the execution context built on them.
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `connection` | `ShardConn`: one SQLite database behind `Arc<Mutex<_>>` |
//! | `collection` | `ConnectionCollection`: read-only name → shard registry |
//! | `context`    | `Executor` trait and the `Context` that implements it   |

pub mod collection;
pub mod connection;
pub mod context;

pub use collection::ConnectionCollection;
pub use connection::ShardConn;
pub use context::{Context, Executor};
