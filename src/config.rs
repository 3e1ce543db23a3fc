//! meshguard configuration.
//!
//! Layers, lowest to highest precedence:
//!   1. built-in defaults
//!   2. `~/.config/meshguard/config.yaml` (or `--config <path>`)
//!   3. `MESHGUARD_*` environment variables, `__` separating sections
//!      (`MESHGUARD_MESH__TIMEOUT_SECS=600`)

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::domain::firewall::DEFAULT_FIREWALL_TIMEOUT;
use crate::domain::mesh::MeshSettings;
use crate::domain::node::{Node, NodeRegistry};
use crate::domain::probe::{ConnectivityProbe, DEFAULT_INTERFACE};
use crate::domain::remote::SshExecutor;
use crate::domain::rules::{PortCatalog, RuleSelector, DEFAULT_OVERLAY_CIDR, DEFAULT_PRIVATE_CIDR};

const ENV_PREFIX: &str = "MESHGUARD_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Private key used for every node without its own `ssh_key_path`.
    pub key_path: Option<String>,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Upper bound for any single remote script.
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            port: 22,
            connect_timeout_secs: 10,
            command_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
    pub status_interval_secs: u64,
    pub tunnel_poll_secs: u64,
    pub interface: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        let settings = MeshSettings::default();
        Self {
            check_interval_secs: settings.check_interval.as_secs(),
            timeout_secs: settings.timeout.as_secs(),
            status_interval_secs: settings.status_interval.as_secs(),
            tunnel_poll_secs: settings.tunnel_poll_interval.as_secs(),
            interface: DEFAULT_INTERFACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub timeout_secs: u64,
    /// WireGuard overlay network; SSH is only allowed from here.
    pub overlay_cidr: String,
    /// Cluster-internal network for control-plane and CNI ports.
    pub private_cidr: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_FIREWALL_TIMEOUT.as_secs(),
            overlay_cidr: DEFAULT_OVERLAY_CIDR.to_string(),
            private_cidr: DEFAULT_PRIVATE_CIDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub http_addr: String,
    pub log_level: String,
    /// Run one mesh verification right after startup.
    pub verify_on_start: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9110".to_string(),
            log_level: "info".to_string(),
            verify_on_start: false,
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("meshguard").join("config.yaml"))
    }

    /// Load all layers. An explicit `path` must exist; the default one may not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    bail!("config file {} does not exist", p.display());
                }
                p.to_path_buf()
            }
            None => Self::default_path()?,
        };

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("loading configuration from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mesh.check_interval_secs == 0 {
            bail!("mesh.check_interval_secs must be greater than zero");
        }
        if self.mesh.tunnel_poll_secs == 0 {
            bail!("mesh.tunnel_poll_secs must be greater than zero");
        }
        if !is_interface_name(&self.mesh.interface) {
            bail!("mesh.interface '{}' is not a valid interface name", self.mesh.interface);
        }
        for (key, cidr) in [
            ("firewall.overlay_cidr", &self.firewall.overlay_cidr),
            ("firewall.private_cidr", &self.firewall.private_cidr),
        ] {
            if !is_cidr(cidr) {
                bail!("{} '{}' is not an address/prefix network", key, cidr);
            }
        }
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                bail!("every node needs a name");
            }
            // Both addresses end up in remote scripts and the ssh destination
            if node.public_ip.parse::<IpAddr>().is_err() {
                bail!("node '{}' has an invalid public_ip '{}'", node.name, node.public_ip);
            }
            if node.wireguard_ip.parse::<IpAddr>().is_err() {
                bail!(
                    "node '{}' has an invalid wireguard_ip '{}'",
                    node.name,
                    node.wireguard_ip
                );
            }
            if !is_login_name(&node.ssh_user) {
                bail!("node '{}' has an invalid ssh_user '{}'", node.name, node.ssh_user);
            }
        }
        Ok(())
    }

    /// Registry holding the configured nodes and SSH defaults.
    pub fn registry(&self) -> Result<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        registry.set_ssh_port(self.ssh.port);
        if let Some(key) = &self.ssh.key_path {
            registry.set_ssh_key_path(expand_home(key));
        }
        for node in &self.nodes {
            let mut node = node.clone();
            if let Some(key) = node.ssh_key_path.take() {
                node.ssh_key_path = Some(expand_home(&key).to_string_lossy().into_owned());
            }
            registry.add_node(node).context("building node inventory")?;
        }
        Ok(registry)
    }

    pub fn mesh_settings(&self) -> MeshSettings {
        MeshSettings {
            check_interval: Duration::from_secs(self.mesh.check_interval_secs),
            timeout: Duration::from_secs(self.mesh.timeout_secs),
            status_interval: Duration::from_secs(self.mesh.status_interval_secs),
            tunnel_poll_interval: Duration::from_secs(self.mesh.tunnel_poll_secs),
        }
    }

    pub fn probe(&self) -> ConnectivityProbe {
        ConnectivityProbe::new(&self.mesh.interface)
    }

    pub fn port_catalog(&self) -> PortCatalog {
        PortCatalog::new(&self.firewall.overlay_cidr, &self.firewall.private_cidr)
    }

    pub fn rule_selector(&self) -> RuleSelector {
        RuleSelector::new(self.port_catalog())
    }

    pub fn firewall_timeout(&self) -> Duration {
        Duration::from_secs(self.firewall.timeout_secs)
    }

    pub fn executor(&self) -> SshExecutor {
        SshExecutor::new(
            Duration::from_secs(self.ssh.connect_timeout_secs),
            Duration::from_secs(self.ssh.command_timeout_secs),
        )
    }
}

/// `addr/prefix` with a prefix no longer than the address family allows.
fn is_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => prefix <= 32,
        Ok(IpAddr::V6(_)) => prefix <= 128,
        Err(_) => false,
    }
}

fn is_interface_name(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 15
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_login_name(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Expand a leading `~/` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
