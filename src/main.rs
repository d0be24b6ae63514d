use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use shardkit::config::ClusterConfig;
use shardkit::db::ConnectionCollection;

mod cmd;

#[derive(Parser)]
#[command(name = "shardkit")]
#[command(version, about = "Shard directory and system database updater")]
pub struct Cli {
    /// Path to the cluster configuration
    #[arg(short, long, global = true, env = "SHARDKIT_CONFIG", default_value = "shardkit.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending system updates to every shard
    Update {
        /// Run every shard inside a transaction that is rolled back
        #[arg(long)]
        dry_run: bool,
    },
    /// Show which system updates each shard has applied
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Manage the shard list mirrored on every shard
    Shards {
        #[command(subcommand)]
        command: ShardsCommands,
    },
    /// Resolve the shard that owns an account or email address
    Route {
        #[arg(long, conflicts_with = "email", required_unless_present = "email")]
        account: Option<i64>,

        #[arg(long)]
        email: Option<String>,
    },
    /// Route an account and its email domain to a shard, on every shard
    Assign {
        /// Name of the owning shard
        shard: String,

        #[arg(long)]
        domain: String,

        #[arg(long)]
        account: i64,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ShardsCommands {
    /// List live shards as seen by each connection
    List {
        #[arg(long)]
        json: bool,
    },
    /// Register a shard everywhere (revives a deleted one)
    Add { name: String },
    /// Soft-delete a shard everywhere
    Delete { name: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = ClusterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, &config, command.clone());
    }

    shardkit::logging::init(&config.logging, cli.verbose)?;
    let connections = Arc::new(
        ConnectionCollection::open(&config.shards).context("Failed to open shard connections")?,
    );

    match &cli.command {
        Commands::Update { dry_run } => {
            config.updater.dry_run |= *dry_run;
            cmd::cmd_update(connections, config.updater.dry_run).await?
        }
        Commands::Info { json } => cmd::cmd_info(connections, *json).await?,
        Commands::Shards { command } => cmd::cmd_shards(&connections, command.clone()).await?,
        Commands::Route { account, email } => {
            cmd::cmd_route(connections, *account, email.clone()).await?
        }
        Commands::Assign {
            shard,
            domain,
            account,
        } => cmd::cmd_assign(&connections, shard, domain, *account).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
