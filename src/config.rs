//! Cluster configuration read from `shardkit.toml`.
//!
//! Layering is file → environment → CLI. The file lists the shards; the
//! environment may override the log level (`SHARDKIT_LOG`) and the dry-run
//! default (`SHARDKIT_DRY_RUN`); CLI flags are applied by the binary last.
//!
//! ```toml
//! [[shards]]
//! name = "shard-a"
//! url = "data/shard-a.db"
//!
//! [[shards]]
//! name = "shard-b"
//! url = "data/shard-b.db"
//!
//! [updater]
//! dry_run = false
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ShardError;

pub const ENV_LOG: &str = "SHARDKIT_LOG";
pub const ENV_DRY_RUN: &str = "SHARDKIT_DRY_RUN";

/// One shard: its unique name and SQLite connection string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub name: String,
    /// SQLite path, `:memory:` or `file:` URI
    pub url: String,
}

/// Output format for the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. "info" or "shardkit=debug"
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Updater section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdaterSection {
    /// Roll back every shard's updates instead of committing them
    #[serde(default)]
    pub dry_run: bool,
}

/// The complete shardkit.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub updater: UpdaterSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ClusterConfig {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ShardError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShardError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ShardError> {
        toml::from_str(content)
            .map_err(|e| ShardError::Config(format!("failed to parse shardkit.toml: {}", e)))
    }

    /// Apply `SHARDKIT_LOG` and `SHARDKIT_DRY_RUN` on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(level) = std::env::var(ENV_LOG) {
            if !level.trim().is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(dry_run) = std::env::var(ENV_DRY_RUN) {
            self.updater.dry_run = matches!(dry_run.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String, ShardError> {
        toml::to_string_pretty(self)
            .map_err(|e| ShardError::Config(format!("failed to serialize config: {}", e)))
    }

    /// Problems that would make the cluster unusable or surprising.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.shards.is_empty() {
            warnings.push("No shards configured; add at least one [[shards]] entry".to_string());
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if shard.name.trim().is_empty() {
                warnings.push(format!("Shard with url '{}' has an empty name", shard.url));
            } else if !seen.insert(shard.name.as_str()) {
                warnings.push(format!("Duplicate shard name '{}'", shard.name));
            }
            if shard.url.trim().is_empty() {
                warnings.push(format!("Shard '{}' has an empty url", shard.name));
            }
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }
}
