//! Mesh service: what the daemon's REST and GraphQL layers talk to.
//!
//! Owns one [`MeshVerifier`] and one [`FirewallManager`] over the same
//! inventory. Reads come straight from their shared result maps. Runs go
//! through a per-kind lock, so concurrent requests queue instead of
//! starting overlapping fan-outs against the same nodes.

use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::firewall::{FirewallManager, FirewallSummary};
use super::mesh::{ConnectivityMatrix, MeshVerifier};
use super::node::Node;
use super::remote::{RemoteExecutor, SshExecutor};
use super::rules::FirewallRule;
use super::types::{ConnectivityResult, DaemonHealth, FirewallResult, RunKind, RunOutcome};

pub struct MeshService<E = SshExecutor> {
    verifier: MeshVerifier<E>,
    firewall: FirewallManager<E>,
    mesh_lock: Mutex<()>,
    firewall_lock: Mutex<()>,
    last_verification: RwLock<Option<RunOutcome>>,
    last_firewall_run: RwLock<Option<RunOutcome>>,
    started: Instant,
}

impl<E: RemoteExecutor> MeshService<E> {
    pub fn new(verifier: MeshVerifier<E>, firewall: FirewallManager<E>) -> Self {
        Self {
            verifier,
            firewall,
            mesh_lock: Mutex::new(()),
            firewall_lock: Mutex::new(()),
            last_verification: RwLock::new(None),
            last_firewall_run: RwLock::new(None),
            started: Instant::now(),
        }
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.verifier.registry().nodes().to_vec()
    }

    pub async fn matrix(&self) -> ConnectivityMatrix {
        self.verifier.connectivity_matrix().await
    }

    pub async fn connectivity(&self) -> Vec<ConnectivityResult> {
        self.verifier.results().await
    }

    pub async fn firewall_results(&self) -> Vec<FirewallResult> {
        self.firewall.results().await
    }

    pub async fn firewall_summary(&self) -> FirewallSummary {
        self.firewall.summary().await
    }

    pub fn rules_for(&self, node: &str) -> Option<Vec<FirewallRule>> {
        self.firewall.rules_for(node)
    }

    /// Run a full mesh verification, waiting for any run already in progress.
    pub async fn verify_mesh(&self) -> RunOutcome {
        let _guard = self.mesh_lock.lock().await;
        let started_at = Utc::now();
        info!("mesh verification requested");

        let outcome = match self.verifier.verify_full_mesh().await {
            Ok(()) => finished(RunKind::MeshVerification, started_at, None, false),
            Err(e) => {
                warn!(error = %e, "mesh verification failed");
                finished(RunKind::MeshVerification, started_at, Some(e.to_string()), e.is_timeout())
            }
        };
        *self.last_verification.write().await = Some(outcome.clone());
        outcome
    }

    /// Configure every node's firewall, waiting for any run already in progress.
    pub async fn configure_firewall(&self) -> RunOutcome {
        let _guard = self.firewall_lock.lock().await;
        let started_at = Utc::now();
        info!("firewall configuration requested");

        let outcome = match self.firewall.configure_all_nodes().await {
            Ok(()) => finished(RunKind::FirewallConfiguration, started_at, None, false),
            Err(e) => {
                warn!(error = %e, "firewall configuration failed");
                finished(RunKind::FirewallConfiguration, started_at, Some(e.to_string()), e.is_timeout())
            }
        };
        *self.last_firewall_run.write().await = Some(outcome.clone());
        outcome
    }

    pub async fn health(&self) -> DaemonHealth {
        DaemonHealth {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            nodes: self.verifier.registry().len(),
            last_verification: self.last_verification.read().await.clone(),
            last_firewall_run: self.last_firewall_run.read().await.clone(),
        }
    }
}

fn finished(
    kind: RunKind,
    started_at: chrono::DateTime<Utc>,
    error: Option<String>,
    timed_out: bool,
) -> RunOutcome {
    RunOutcome {
        kind,
        success: error.is_none(),
        timed_out,
        error,
        started_at,
        finished_at: Utc::now(),
    }
}
