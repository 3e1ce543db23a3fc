mod api;
mod commands;
mod config;
mod domain;
mod server;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "meshguard",
    version,
    about = "WireGuard full-mesh verifier and OS firewall configurator for cluster nodes"
)]
struct Cli {
    /// Path to config file (default: ~/.config/meshguard/config.yaml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error); for the daemon it overrides config
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the node inventory
    Nodes {
        /// Output format (table, json or yaml)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// WireGuard mesh verification
    Mesh {
        #[command(subcommand)]
        command: MeshCommands,
    },

    /// Host firewall configuration
    Firewall {
        #[command(subcommand)]
        command: FirewallCommands,
    },

    /// Run the meshguard daemon (REST + GraphQL)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,
    },
}

#[derive(Subcommand)]
enum MeshCommands {
    /// Verify every node reaches every other node over WireGuard
    Verify {
        /// Overall timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,

        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Wait until every node's WireGuard interface is up
    Wait {
        /// Overall timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand)]
enum FirewallCommands {
    /// Configure the host firewall on every node
    Apply {
        /// Overall timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show the rules a role set or a node would receive, or the whole catalog
    Rules {
        /// Comma-separated roles, e.g. controlplane,etcd
        #[arg(long, conflicts_with = "node")]
        role: Option<String>,

        /// Node name from the inventory
        #[arg(long)]
        node: Option<String>,

        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Print the configuration script a node would run
    Script {
        /// Node name from the inventory
        node: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    // The daemon sets up its own JSON subscriber
    if !matches!(cli.command, Commands::Daemon { .. }) {
        commands::init_tracing(cli.log_level.as_deref().unwrap_or("info"));
    }

    match cli.command {
        Commands::Nodes { format } => commands::nodes::run(config, &format),
        Commands::Mesh { command } => match command {
            MeshCommands::Verify { timeout, format } => {
                commands::mesh::verify(config, timeout, &format)
            }
            MeshCommands::Wait { timeout } => commands::mesh::wait(config, timeout),
        },
        Commands::Firewall { command } => match command {
            FirewallCommands::Apply { timeout } => commands::firewall::apply(config, timeout),
            FirewallCommands::Rules { role, node, format } => {
                commands::firewall::rules(config, role.as_deref(), node.as_deref(), &format)
            }
            FirewallCommands::Script { node } => commands::firewall::script(config, &node),
        },
        Commands::Daemon { http_addr } => {
            commands::daemon::run(config, http_addr, cli.log_level)
        }
    }
}
