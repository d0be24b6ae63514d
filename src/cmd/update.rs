//! System update commands: `shardkit update` and `shardkit info`.

use std::sync::Arc;

use anyhow::Result;
use console::style;

use shardkit::db::ConnectionCollection;
use shardkit::updater::{ShardReport, Updater, system_updates};

pub async fn cmd_update(connections: Arc<ConnectionCollection>, dry_run: bool) -> Result<()> {
    let updater = Updater::new(connections, system_updates()?);

    println!();
    if dry_run {
        println!("{}", style("System updates (dry run)").bold().cyan());
    } else {
        println!("{}", style("System updates").bold().cyan());
    }
    println!();

    match updater.run_all(dry_run).await {
        Ok(report) => {
            print_reports(&report.shards);
            println!();
            if dry_run {
                println!("All shards would apply cleanly. Nothing was written.");
            } else {
                println!("{}", style("All shards up to date.").green());
            }
            Ok(())
        }
        Err(err) => {
            print_reports(&err.reports);
            println!();
            println!(
                "{} {} of {} shards failed",
                style("Error:").red().bold(),
                err.failures.len(),
                err.reports.len()
            );
            Err(err.into())
        }
    }
}

fn print_reports(reports: &[ShardReport]) {
    for report in reports {
        let marker = if report.is_ok() {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!(
            "  {} {}  applied {}, skipped {}",
            marker,
            style(&report.shard).bold(),
            report.applied.len(),
            report.skipped.len()
        );
        for name in &report.applied {
            println!("      + {}", name);
        }
        if let Some(failed) = &report.failed {
            println!("      {} {}", style("!").red(), failed);
        }
    }
}

pub async fn cmd_info(connections: Arc<ConnectionCollection>, json: bool) -> Result<()> {
    let updater = Updater::new(connections, system_updates()?);
    let info = updater.db_update_info().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!();
    for (shard, updates) in &info {
        println!("{}", style(shard).bold().cyan());
        for update in updates {
            let status = match &update.applied_at {
                Some(at) => style(format!("applied {}", at)).green(),
                None => style("pending".to_string()).yellow(),
            };
            println!("  {:<28} {}", update.name, status);
            if !update.description.is_empty() {
                println!("  {}", style(&update.description).dim());
            }
        }
        println!();
    }
    Ok(())
}
