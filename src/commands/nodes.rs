//! `meshguard nodes`

use anyhow::{bail, Result};
use colored::Colorize;

use crate::domain::node::NodeRegistry;

pub fn run(config_path: Option<&str>, format: &str) -> Result<()> {
    let config = super::load_config(config_path)?;
    let registry = config.registry()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(registry.nodes())?),
        "yaml" => print!("{}", serde_yaml::to_string(registry.nodes())?),
        "table" => print_table(&registry),
        other => bail!("unknown format '{}' (expected table, json or yaml)", other),
    }
    Ok(())
}

fn print_table(registry: &NodeRegistry) {
    if registry.is_empty() {
        println!("{} No nodes configured", "::".blue().bold());
        println!("   Add nodes under the `nodes` section of config.yaml.");
        return;
    }

    println!("{}", "Nodes".bold());
    println!();
    for node in registry.nodes() {
        let roles: Vec<String> = node.roles().iter().map(|r| r.to_string()).collect();
        let roles = if roles.is_empty() {
            "no roles".dimmed().to_string()
        } else {
            roles.join(",")
        };
        println!(
            "  {:<16} {:<16} {:<14} {}",
            node.name.bold(),
            node.public_ip,
            node.wireguard_ip.dimmed(),
            roles
        );
    }
    println!();
}
