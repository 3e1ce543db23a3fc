//! Firewall rule catalog and role-based rule selection.
//!
//! The catalog is a plain value built once from configuration and handed to
//! the [`RuleSelector`]; tests and callers can swap any entry by building
//! their own catalog.

use std::fmt;

use async_graphql::{Enum, SimpleObject};
use serde::{Deserialize, Serialize};

use super::node::{Node, NodeRole};

/// Source CIDR meaning "anyone".
pub const ANY_SOURCE: &str = "0.0.0.0/0";
pub const DEFAULT_OVERLAY_CIDR: &str = "10.8.0.0/24";
pub const DEFAULT_PRIVATE_CIDR: &str = "10.0.0.0/8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// One port (or `low:high` range) opened for a protocol and source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct FirewallRule {
    pub port: String,
    pub protocol: Protocol,
    pub source: String,
    pub direction: Direction,
    pub action: RuleAction,
    pub description: String,
}

impl FirewallRule {
    /// Inbound allow rule, the only kind the catalog contains.
    pub fn allow_inbound(port: &str, protocol: Protocol, source: &str, description: &str) -> Self {
        Self {
            port: port.to_string(),
            protocol,
            source: source.to_string(),
            direction: Direction::Inbound,
            action: RuleAction::Allow,
            description: description.to_string(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.source == ANY_SOURCE
    }

    /// `(low, high)` for `low:high` ranges, `(p, p)` for a single port.
    pub fn port_range(&self) -> Option<(u16, u16)> {
        match self.port.split_once(':') {
            Some((low, high)) => {
                let low = low.trim().parse().ok()?;
                let high = high.trim().parse().ok()?;
                (low <= high).then_some((low, high))
            }
            None => {
                let port = self.port.trim().parse().ok()?;
                Some((port, port))
            }
        }
    }
}

/// Every port rule the cluster knows about, keyed by purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCatalog {
    // Control plane
    pub api_server: FirewallRule,
    pub etcd: FirewallRule,
    pub etcd_peer: FirewallRule,
    pub scheduler: FirewallRule,
    pub controller_manager: FirewallRule,
    pub kubelet: FirewallRule,
    pub kube_proxy: FirewallRule,

    // Workers
    pub node_port_services: FirewallRule,

    // CNI
    pub flannel: FirewallRule,
    pub calico: FirewallRule,
    pub canal_bgp: FirewallRule,
    pub weave: FirewallRule,

    // Infrastructure
    pub ssh: FirewallRule,
    pub wireguard: FirewallRule,
    pub docker_registry: FirewallRule,
    pub metrics_server: FirewallRule,

    // Ingress
    pub http_ingress: FirewallRule,
    pub https_ingress: FirewallRule,
}

impl Default for PortCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAY_CIDR, DEFAULT_PRIVATE_CIDR)
    }
}

impl PortCatalog {
    /// `overlay_cidr` is the WireGuard network (SSH is only reachable there);
    /// `private_cidr` bounds the cluster-internal ports.
    pub fn new(overlay_cidr: &str, private_cidr: &str) -> Self {
        use Protocol::{Tcp, Udp};
        let rule = FirewallRule::allow_inbound;

        Self {
            api_server: rule("6443", Tcp, private_cidr, "Kubernetes API Server"),
            etcd: rule("2379", Tcp, private_cidr, "etcd client API"),
            etcd_peer: rule("2380", Tcp, private_cidr, "etcd peer API"),
            scheduler: rule("10259", Tcp, private_cidr, "kube-scheduler"),
            controller_manager: rule("10257", Tcp, private_cidr, "kube-controller-manager"),
            kubelet: rule("10250", Tcp, private_cidr, "Kubelet API"),
            kube_proxy: rule("10256", Tcp, private_cidr, "kube-proxy"),

            node_port_services: rule("30000:32767", Tcp, ANY_SOURCE, "NodePort Services"),

            flannel: rule("8472", Udp, private_cidr, "Flannel VXLAN"),
            calico: rule("179", Tcp, private_cidr, "Calico BGP"),
            canal_bgp: rule("179", Tcp, private_cidr, "Canal BGP"),
            weave: rule("6783", Tcp, private_cidr, "Weave Net"),

            ssh: rule("22", Tcp, overlay_cidr, "SSH via WireGuard"),
            wireguard: rule("51820", Udp, ANY_SOURCE, "WireGuard VPN"),
            docker_registry: rule("5000", Tcp, private_cidr, "Docker Registry"),
            metrics_server: rule("10255", Tcp, private_cidr, "Metrics Server"),

            http_ingress: rule("80", Tcp, ANY_SOURCE, "HTTP Ingress"),
            https_ingress: rule("443", Tcp, ANY_SOURCE, "HTTPS Ingress"),
        }
    }

    pub fn all(&self) -> Vec<&FirewallRule> {
        vec![
            &self.api_server,
            &self.etcd,
            &self.etcd_peer,
            &self.scheduler,
            &self.controller_manager,
            &self.kubelet,
            &self.kube_proxy,
            &self.node_port_services,
            &self.flannel,
            &self.calico,
            &self.canal_bgp,
            &self.weave,
            &self.ssh,
            &self.wireguard,
            &self.docker_registry,
            &self.metrics_server,
            &self.http_ingress,
            &self.https_ingress,
        ]
    }
}

/// Maps a node's roles to the ordered list of rules it needs.
#[derive(Debug, Clone, Default)]
pub struct RuleSelector {
    catalog: PortCatalog,
}

impl RuleSelector {
    pub fn new(catalog: PortCatalog) -> Self {
        Self { catalog }
    }

    pub fn rules_for_node(&self, node: &Node) -> Vec<FirewallRule> {
        self.select(node.is_control_plane(), node.is_worker())
    }

    pub fn rules_for_roles(&self, roles: &[NodeRole]) -> Vec<FirewallRule> {
        let control_plane = roles
            .iter()
            .any(|r| matches!(r, NodeRole::Master | NodeRole::Controlplane));
        self.select(control_plane, roles.contains(&NodeRole::Worker))
    }

    fn select(&self, control_plane: bool, worker: bool) -> Vec<FirewallRule> {
        let c = &self.catalog;
        let mut rules = vec![
            c.ssh.clone(),
            c.wireguard.clone(),
            c.kubelet.clone(),
            c.kube_proxy.clone(),
        ];

        if control_plane {
            rules.extend([
                c.api_server.clone(),
                c.etcd.clone(),
                c.etcd_peer.clone(),
                c.scheduler.clone(),
                c.controller_manager.clone(),
            ]);
        }

        if worker {
            rules.push(c.node_port_services.clone());
        }

        // Canal is the cluster's CNI
        rules.extend([c.canal_bgp.clone(), c.flannel.clone()]);
        rules.push(c.metrics_server.clone());

        if worker {
            rules.extend([c.http_ingress.clone(), c.https_ingress.clone()]);
        }

        rules
    }
}
