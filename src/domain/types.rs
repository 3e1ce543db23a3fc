use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_graphql::{ComplexObject, Enum, SimpleObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::FirewallRule;

// ── Mesh ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct WireGuardStats {
    pub interface: String,
    pub public_key: Option<String>,
    pub endpoint: Option<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
    pub persistent_keepalive: Option<u32>,
}

/// Reachability of one target as observed from a source node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
#[graphql(complex)]
pub struct ConnectionStatus {
    pub target_node: String,
    pub target_ip: String,
    pub is_connected: bool,
    #[graphql(skip)]
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Duration,
    pub packet_loss: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub wireguard: Option<WireGuardStats>,
}

#[ComplexObject]
impl ConnectionStatus {
    async fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

impl ConnectionStatus {
    pub fn new(target_node: &str, target_ip: &str) -> Self {
        Self {
            target_node: target_node.to_string(),
            target_ip: target_ip.to_string(),
            is_connected: false,
            latency: Duration::ZERO,
            packet_loss: 0.0,
            last_check: None,
            error: None,
            wireguard: None,
        }
    }
}

/// Everything one source node knows about its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
#[graphql(complex)]
pub struct ConnectivityResult {
    pub source_node: String,
    #[graphql(skip)]
    pub connections: BTreeMap<String, ConnectionStatus>,
    pub all_connected: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[ComplexObject]
impl ConnectivityResult {
    #[graphql(name = "connections")]
    async fn graphql_connections(&self) -> Vec<ConnectionStatus> {
        self.connections.values().cloned().collect()
    }

    #[graphql(name = "connectedCount")]
    async fn graphql_connected_count(&self) -> usize {
        self.connected_count()
    }
}

impl ConnectivityResult {
    /// Empty result registered before any probing happens.
    pub fn new(source_node: &str) -> Self {
        Self {
            source_node: source_node.to_string(),
            connections: BTreeMap::new(),
            all_connected: false,
            timestamp: None,
            error: None,
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connections.values().filter(|c| c.is_connected).count()
    }

    /// Targets with a recorded, failed probe, sorted by name.
    pub fn failed_targets(&self) -> Vec<String> {
        self.connections
            .values()
            .filter(|c| !c.is_connected)
            .map(|c| c.target_node.clone())
            .collect()
    }

    /// `all_connected` holds iff every one of `expected_peers` has a connected entry.
    pub fn recompute(&mut self, expected_peers: usize) {
        self.all_connected = self.connections.len() == expected_peers
            && self.connections.values().all(|c| c.is_connected);
    }
}

// ── Firewall ───────────────────────────────────────────────

/// Host firewall implementation detected on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    Ufw,
    Firewalld,
    Iptables,
}

impl FromStr for FirewallBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ufw" => Ok(FirewallBackend::Ufw),
            "firewalld" => Ok(FirewallBackend::Firewalld),
            "iptables" => Ok(FirewallBackend::Iptables),
            other => Err(format!("unsupported firewall backend '{}'", other)),
        }
    }
}

impl fmt::Display for FirewallBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallBackend::Ufw => write!(f, "ufw"),
            FirewallBackend::Firewalld => write!(f, "firewalld"),
            FirewallBackend::Iptables => write!(f, "iptables"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct FirewallResult {
    pub node_name: String,
    pub success: bool,
    pub backend: Option<FirewallBackend>,
    pub rules_applied: Vec<FirewallRule>,
    pub error: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl FirewallResult {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            success: false,
            backend: None,
            rules_applied: Vec::new(),
            error: None,
            timestamp: None,
        }
    }
}

// ── Daemon ─────────────────────────────────────────────────

/// Which kind of run a [`RunOutcome`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    MeshVerification,
    FirewallConfiguration,
}

/// Result of one verification or firewall run triggered through the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct RunOutcome {
    pub kind: RunKind,
    pub success: bool,
    pub timed_out: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct DaemonHealth {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub nodes: usize,
    pub last_verification: Option<RunOutcome>,
    pub last_firewall_run: Option<RunOutcome>,
}

/// Serialize a `Duration` as fractional milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::domain::probe::millis_to_duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if ms.is_finite() && ms >= 0.0 {
            Ok(millis_to_duration(ms))
        } else {
            Ok(Duration::ZERO)
        }
    }
}
