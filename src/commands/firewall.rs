//! `meshguard firewall apply|rules|script`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::domain::firewall::FirewallManager;
use crate::domain::node::parse_roles;
use crate::domain::rules::FirewallRule;

pub fn apply(config_path: Option<&str>, timeout: Option<u64>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.firewall_timeout());
    let manager = FirewallManager::with_registry(
        Arc::new(config.executor()),
        config.rule_selector(),
        timeout,
        config.registry()?,
    );

    println!(
        "{} Configuring OS firewalls on {} nodes",
        ">>".blue().bold(),
        manager.registry().len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let (outcome, summary) = runtime.block_on(async {
        let outcome = manager.configure_all_nodes().await;
        (outcome, manager.summary().await)
    });

    println!();
    for line in &summary.lines {
        if line.starts_with('✓') {
            println!("  {}", line.green());
        } else {
            println!("  {}", line.red());
        }
    }
    println!();

    match outcome {
        Ok(()) => {
            println!(
                "{} {} nodes configured",
                "ok".green().bold(),
                summary.succeeded
            );
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "!!".red().bold(), e);
            for node in e.nodes() {
                println!("     {} {}", "✗".red(), node);
            }
            Err(e.into())
        }
    }
}

pub fn rules(
    config_path: Option<&str>,
    role: Option<&str>,
    node: Option<&str>,
    format: &str,
) -> Result<()> {
    let config = super::load_config(config_path)?;
    let selector = config.rule_selector();

    let (title, rules) = match (role, node) {
        (Some(role), _) => {
            let roles = parse_roles(role);
            if roles.is_empty() {
                bail!("no known roles in '{}'", role);
            }
            (format!("roles {}", role), selector.rules_for_roles(&roles))
        }
        (None, Some(name)) => {
            let registry = config.registry()?;
            let node = registry
                .get(name)
                .with_context(|| format!("node '{}' is not in the inventory", name))?;
            (format!("node {}", name), selector.rules_for_node(node))
        }
        (None, None) => (
            "every catalog entry".to_string(),
            config.port_catalog().all().into_iter().cloned().collect(),
        ),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rules)?),
        "table" => print_rules(&title, &rules),
        other => bail!("unknown format '{}' (expected table or json)", other),
    }
    Ok(())
}

pub fn script(config_path: Option<&str>, node: &str) -> Result<()> {
    let config = super::load_config(config_path)?;
    let manager = FirewallManager::with_registry(
        Arc::new(config.executor()),
        config.rule_selector(),
        config.firewall_timeout(),
        config.registry()?,
    );
    let script = manager
        .render_script(node)
        .with_context(|| format!("node '{}' is not in the inventory", node))?;
    print!("{}", script);
    Ok(())
}

fn print_rules(title: &str, rules: &[FirewallRule]) {
    println!("{} {}", "Firewall rules for".bold(), title.bold());
    println!();
    for rule in rules {
        println!(
            "  {:<12} {:<4} {:<14} {}",
            rule.port,
            rule.protocol.to_string(),
            rule.source.dimmed(),
            rule.description
        );
    }
    println!();
}
