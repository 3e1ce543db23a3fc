//! Node: a cluster member as seen by the mesh verifier and firewall manager.
//!
//! Nodes are declared once (inventory in config.yaml) and never change while a
//! verification or firewall run is in progress. The [`NodeRegistry`] keeps them
//! in registration order, which is also the order peers are probed in.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_graphql::{ComplexObject, Enum, SimpleObject};
use serde::{Deserialize, Serialize};

use super::error::RegistryError;
use super::remote::SshTarget;

/// Label key holding the comma-separated role set (`controlplane,etcd,worker`).
pub const ROLE_LABEL: &str = "role";

/// A single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
#[graphql(complex)]
pub struct Node {
    pub name: String,
    pub public_ip: String,
    pub wireguard_ip: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[graphql(skip)]
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[graphql(skip)]
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

#[ComplexObject]
impl Node {
    #[graphql(name = "roles")]
    async fn graphql_roles(&self) -> Vec<NodeRole> {
        self.roles()
    }
}

impl Node {
    pub fn new(name: &str, public_ip: &str, wireguard_ip: &str) -> Self {
        Self {
            name: name.to_string(),
            public_ip: public_ip.to_string(),
            wireguard_ip: wireguard_ip.to_string(),
            ssh_user: default_ssh_user(),
            ssh_port: None,
            ssh_key_path: None,
            labels: BTreeMap::new(),
        }
    }

    /// Builder-style helper that sets the `role` label.
    pub fn with_role(mut self, roles: &str) -> Self {
        self.labels.insert(ROLE_LABEL.to_string(), roles.to_string());
        self
    }

    /// Roles parsed from the `role` label. Unknown role names are ignored.
    pub fn roles(&self) -> Vec<NodeRole> {
        self.labels
            .get(ROLE_LABEL)
            .map(|value| parse_roles(value))
            .unwrap_or_default()
    }

    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles().contains(&role)
    }

    /// Master and controlplane are interchangeable names for the same duty.
    pub fn is_control_plane(&self) -> bool {
        self.roles()
            .iter()
            .any(|r| matches!(r, NodeRole::Master | NodeRole::Controlplane))
    }

    pub fn is_worker(&self) -> bool {
        self.has_role(NodeRole::Worker)
    }
}

/// Kubernetes role a node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Controlplane,
    Worker,
    Etcd,
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "controlplane" | "control-plane" => Ok(NodeRole::Controlplane),
            "worker" => Ok(NodeRole::Worker),
            "etcd" => Ok(NodeRole::Etcd),
            other => Err(format!("unknown node role '{}'", other)),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Controlplane => write!(f, "controlplane"),
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::Etcd => write!(f, "etcd"),
        }
    }
}

/// Parse a comma-separated role set, dropping anything unrecognised.
pub fn parse_roles(value: &str) -> Vec<NodeRole> {
    let mut roles = Vec::new();
    for role in value.split(',').filter_map(|r| r.parse::<NodeRole>().ok()) {
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    roles
}

/// Ordered, append-only set of nodes plus the SSH defaults used to reach them.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
    ssh_key_path: Option<PathBuf>,
    ssh_port: u16,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            ssh_key_path: None,
            ssh_port: 22,
        }
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node. Names are the registry key and must be unique.
    pub fn add_node(&mut self, node: Node) -> Result<(), RegistryError> {
        if self.get(&node.name).is_some() {
            return Err(RegistryError::DuplicateNode(node.name));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn set_ssh_key_path(&mut self, path: impl Into<PathBuf>) {
        self.ssh_key_path = Some(path.into());
    }

    pub fn set_ssh_port(&mut self, port: u16) {
        self.ssh_port = port;
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every registered node except `name`, in registration order.
    pub fn peers_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.name != name)
    }

    /// SSH material for a node: per-node overrides win over registry defaults.
    pub fn ssh_target(&self, node: &Node) -> SshTarget {
        SshTarget {
            host: node.public_ip.clone(),
            port: node.ssh_port.unwrap_or(self.ssh_port),
            user: node.ssh_user.clone(),
            key_path: node
                .ssh_key_path
                .as_ref()
                .map(PathBuf::from)
                .or_else(|| self.ssh_key_path.clone()),
        }
    }
}
