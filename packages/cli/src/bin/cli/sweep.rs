// ABOUTME: CLI command removing orphaned sandbox containers
// ABOUTME: Targets only containers carrying the runbox management label

use anyhow::{Context, Result};
use colored::*;

use runbox_sandboxes::ContainerManager;

pub async fn sweep_command() -> Result<()> {
    let manager = ContainerManager::new()
        .await
        .context("Failed to connect to Docker")?;

    let removed = manager.remove_orphaned_containers().await?;
    if removed.is_empty() {
        println!("{}", "No orphaned containers found".green());
        return Ok(());
    }

    println!("Removed {} orphaned containers:", removed.len().to_string().bold());
    for id in removed {
        println!("  {}", id);
    }
    Ok(())
}
