//! `meshguard mesh verify` / `meshguard mesh wait`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use colored::Colorize;

use crate::config::Config;
use crate::domain::mesh::MeshVerifier;
use crate::domain::remote::SshExecutor;
use crate::domain::types::ConnectivityResult;

fn verifier(config: &Config, timeout: Option<u64>) -> Result<MeshVerifier<SshExecutor>> {
    let mut settings = config.mesh_settings();
    if let Some(secs) = timeout {
        settings.timeout = Duration::from_secs(secs);
    }
    Ok(
        MeshVerifier::with_registry(Arc::new(config.executor()), settings, config.registry()?)
            .with_probe(config.probe()),
    )
}

pub fn verify(config_path: Option<&str>, timeout: Option<u64>, format: &str) -> Result<()> {
    if !matches!(format, "table" | "json") {
        bail!("unknown format '{}' (expected table or json)", format);
    }
    let config = super::load_config(config_path)?;
    let verifier = verifier(&config, timeout)?;

    if format == "table" {
        println!(
            "{} Verifying WireGuard mesh across {} nodes (timeout {}s)",
            ">>".blue().bold(),
            verifier.registry().len(),
            verifier.settings().timeout.as_secs()
        );
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let (outcome, results, matrix) = runtime.block_on(async {
        let outcome = verifier.verify_full_mesh().await;
        (outcome, verifier.results().await, verifier.render_matrix().await)
    });

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!();
        for line in matrix.lines() {
            println!("  {}", colorize_cells(line));
        }
        println!();
        for result in &results {
            print_result(result, verifier.registry().len().saturating_sub(1));
        }
        println!();
    }

    match outcome {
        Ok(()) => {
            if format == "table" {
                println!("{} VPN full mesh connectivity verified", "ok".green().bold());
            }
            Ok(())
        }
        Err(e) => {
            if format == "table" {
                println!("{} {}", "!!".red().bold(), e);
            }
            Err(e.into())
        }
    }
}

pub fn wait(config_path: Option<&str>, timeout: Option<u64>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let verifier = verifier(&config, timeout)?;

    println!(
        "{} Waiting for WireGuard tunnels on {} nodes",
        ">>".blue().bold(),
        verifier.registry().len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(verifier.wait_for_tunnels())?;

    println!("{} All WireGuard tunnels are up", "ok".green().bold());
    Ok(())
}

fn print_result(result: &ConnectivityResult, peers: usize) {
    let icon = if result.all_connected {
        "ok".green().bold()
    } else {
        "!!".red().bold()
    };
    println!(
        "  {} {}: {}/{} peers connected",
        icon,
        result.source_node.bold(),
        result.connected_count(),
        peers
    );
    if let Some(error) = &result.error {
        println!("     {}", error.red());
    }
    for target in result.failed_targets() {
        let Some(conn) = result.connections.get(&target) else {
            continue;
        };
        let reason = conn.error.as_deref().unwrap_or("no ping reply");
        println!(
            "     {} {} ({}): {}",
            "✗".red(),
            conn.target_node,
            conn.target_ip.dimmed(),
            reason
        );
    }
}

fn colorize_cells(line: &str) -> String {
    line.split('\t')
        .map(|cell| {
            if cell.starts_with('✓') {
                cell.green().to_string()
            } else if cell == "✗" {
                cell.red().to_string()
            } else if cell == "?" || cell == "---" {
                cell.dimmed().to_string()
            } else {
                cell.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\t")
}
