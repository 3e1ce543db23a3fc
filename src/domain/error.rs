//! Error types for the mesh verifier and firewall configurator.

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Node registration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node '{0}' is already registered")]
    DuplicateNode(String),
}

/// Transport failures from a [`RemoteExecutor`](super::remote::RemoteExecutor).
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("failed to start ssh to {host}: {message}")]
    Spawn { host: String, message: String },

    #[error("remote command on {host} exited with {status}: {stderr}")]
    NonZeroExit {
        host: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("remote command on {host} did not finish within {after:?}")]
    TimedOut { host: String, after: Duration },

    #[error("{0}")]
    Other(String),
}

impl ExecError {
    pub fn non_zero(host: &str, status: ExitStatus, stdout: String, stderr: String) -> Self {
        Self::NonZeroExit {
            host: host.to_string(),
            status: status.to_string(),
            stdout,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Captured stdout, when the remote side ran far enough to produce any.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}

/// Outcome of a full-mesh verification that did not converge.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The deadline elapsed before every worker reported.
    #[error("timeout after {after:?} waiting for VPN connectivity verification ({} unresolved: {})", .unresolved.len(), .unresolved.join(", "))]
    Timeout {
        after: Duration,
        unresolved: Vec<String>,
    },

    /// Every worker reported, but some pairs never connected.
    #[error("VPN connectivity verification failed: {}", .pairs.join(", "))]
    Unconverged { pairs: Vec<String> },

    #[error("timeout after {after:?} waiting for WireGuard tunnels on: {}", .pending.join(", "))]
    TunnelTimeout {
        after: Duration,
        pending: Vec<String>,
    },
}

/// Outcome of a firewall run where at least one node was not configured.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// `nodes` lists every unconfigured node; `pending` the subset that never reported.
    #[error("timeout after {after:?} configuring OS firewalls, not configured: {}", .nodes.join(", "))]
    Timeout {
        after: Duration,
        pending: Vec<String>,
        nodes: Vec<String>,
    },

    #[error("firewall configuration failed on nodes: {}", .nodes.join(", "))]
    Failed { nodes: Vec<String> },
}

impl MeshError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::TunnelTimeout { .. })
    }
}

impl FirewallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Every node this error reports as not configured.
    pub fn nodes(&self) -> &[String] {
        match self {
            Self::Timeout { nodes, .. } | Self::Failed { nodes } => nodes,
        }
    }
}
