pub mod daemon;
pub mod firewall;
pub mod mesh;
pub mod nodes;

use std::path::Path;

use anyhow::Result;

use crate::config::Config;

/// Human-readable logs on stderr, so stdout stays clean for `--format json`.
pub fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub(crate) fn load_config(path: Option<&str>) -> Result<Config> {
    Config::load(path.map(Path::new))
}
