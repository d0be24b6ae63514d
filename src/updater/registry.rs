use std::collections::HashSet;

use super::descriptor::UpdateSpec;
use crate::errors::ShardError;

/// Ordered list of updates, applied on every shard in registration order.
#[derive(Debug, Clone, Default)]
pub struct UpdateRegistry {
    updates: Vec<UpdateSpec>,
    names: HashSet<String>,
}

impl UpdateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `spec`. A name that is already registered is a config error.
    pub fn register(&mut self, spec: UpdateSpec) -> Result<&mut Self, ShardError> {
        if !self.names.insert(spec.name().to_string()) {
            return Err(ShardError::Config(format!(
                "update '{}' is registered twice",
                spec.name()
            )));
        }
        self.updates.push(spec);
        Ok(self)
    }

    /// Builder form of [`UpdateRegistry::register`].
    pub fn with(mut self, spec: UpdateSpec) -> Result<Self, ShardError> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn updates(&self) -> &[UpdateSpec] {
        &self.updates
    }

    pub fn names(&self) -> Vec<&str> {
        self.updates.iter().map(UpdateSpec::name).collect()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// The application tables every shard carries, in dependency order.
///
/// Fails with a config error if two entries share a name.
pub fn system_updates() -> Result<UpdateRegistry, ShardError> {
    let mut registry = UpdateRegistry::new();
    for spec in [
        UpdateSpec::sql(
            "create_accounts",
            "Accounts table",
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                domain TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                deleted_at TEXT
            );",
        ),
        UpdateSpec::sql(
            "create_users",
            "Users table, one row per login",
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                password_hash TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_users_account ON users(account_id);",
        ),
        UpdateSpec::sql(
            "create_system_jobs",
            "Recurring maintenance jobs",
            "CREATE TABLE IF NOT EXISTS system_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                interval_seconds INTEGER NOT NULL DEFAULT 3600,
                last_run_at TEXT,
                next_run_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        ),
        UpdateSpec::sql(
            "create_queue_jobs",
            "Background job queue",
            "CREATE TABLE IF NOT EXISTS queue_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER REFERENCES accounts(id),
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'queued'
                    CHECK(status IN ('queued', 'running', 'done', 'failed')),
                attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                run_at TEXT NOT NULL DEFAULT (datetime('now')),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_status ON queue_jobs(status, run_at);",
        ),
        UpdateSpec::sql(
            "index_shard_map_domain",
            "Index shard_map by domain for email routing",
            "CREATE INDEX IF NOT EXISTS idx_shard_map_domain ON shard_map(domain);",
        ),
    ] {
        registry.register(spec)?;
    }
    Ok(registry)
}
