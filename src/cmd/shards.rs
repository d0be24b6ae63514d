//! Shard directory commands: `shards`, `route` and `assign`.

use std::sync::Arc;

use anyhow::{Result, bail};
use console::style;

use super::super::ShardsCommands;
use shardkit::db::{ConnectionCollection, Context};
use shardkit::directory::{
    Shard, cluster_add_shard, cluster_assign_account, cluster_delete_shard, cluster_get_shards,
    fetch_shard_by_account_id, fetch_shard_by_email,
};

pub async fn cmd_shards(
    connections: &Arc<ConnectionCollection>,
    command: ShardsCommands,
) -> Result<()> {
    match command {
        ShardsCommands::List { json } => {
            let by_conn = cluster_get_shards(connections).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&by_conn)?);
                return Ok(());
            }
            println!();
            for (conn, shards) in &by_conn {
                println!("{}", style(conn).bold().cyan());
                if shards.is_empty() {
                    println!("  {}", style("(no shards)").dim());
                }
                for shard in shards {
                    print_shard(shard);
                }
                println!();
            }
        }
        ShardsCommands::Add { name } => {
            cluster_add_shard(connections, &name).await?;
            println!(
                "Added shard {} on {} connections",
                style(&name).bold(),
                connections.len()
            );
        }
        ShardsCommands::Delete { name } => {
            cluster_delete_shard(connections, &name).await?;
            println!(
                "Deleted shard {} on {} connections",
                style(&name).bold(),
                connections.len()
            );
        }
    }
    Ok(())
}

fn print_shard(shard: &Shard) {
    println!(
        "  {:>4}  {:<20} {} accounts",
        shard.id, shard.name, shard.account_count
    );
}

pub async fn cmd_route(
    connections: Arc<ConnectionCollection>,
    account: Option<i64>,
    email: Option<String>,
) -> Result<()> {
    let session = connections.get_random()?;
    let shard = session
        .call(move |session| {
            let mut ctx = Context::new(Arc::clone(&connections), session.clone());
            match (account, email) {
                (Some(id), _) => fetch_shard_by_account_id(&mut ctx, id),
                (None, Some(email)) => fetch_shard_by_email(&mut ctx, &email),
                (None, None) => Ok(None),
            }
        })
        .await?;

    match shard {
        Some(shard) => {
            println!("{}", shard.name);
            Ok(())
        }
        None => bail!("No shard owns that account or email"),
    }
}

pub async fn cmd_assign(
    connections: &Arc<ConnectionCollection>,
    shard: &str,
    domain: &str,
    account: i64,
) -> Result<()> {
    cluster_assign_account(connections, shard, domain, account).await?;
    println!(
        "Account {} ({}) routed to {}",
        account,
        domain,
        style(shard).bold()
    );
    Ok(())
}
