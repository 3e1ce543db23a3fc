//! OS firewall configuration across the cluster.
//!
//! Each node gets one script, rendered from the rules its roles select, and
//! one attempt at running it. There is no retry and no rollback: a node that
//! fails keeps whatever state the script left behind and is named in the
//! returned error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{self, Instant};
use tracing::{info, warn};

use super::error::{FirewallError, RegistryError};
use super::fanout::{self, WorkerError};
use super::firewall_script;
use super::node::{Node, NodeRegistry};
use super::remote::{RemoteExecutor, SshTarget};
use super::rules::{FirewallRule, RuleSelector};
use super::types::FirewallResult;

pub const DEFAULT_FIREWALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Counts and per-node lines describing the last run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirewallSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub lines: Vec<String>,
}

pub struct FirewallManager<E> {
    registry: Arc<NodeRegistry>,
    executor: Arc<E>,
    selector: RuleSelector,
    timeout: Duration,
    results: Arc<RwLock<HashMap<String, FirewallResult>>>,
}

impl<E: RemoteExecutor> FirewallManager<E> {
    pub fn new(executor: Arc<E>, selector: RuleSelector, timeout: Duration) -> Self {
        Self::with_registry(executor, selector, timeout, NodeRegistry::new())
    }

    pub fn with_registry(
        executor: Arc<E>,
        selector: RuleSelector,
        timeout: Duration,
        registry: NodeRegistry,
    ) -> Self {
        let results = registry
            .nodes()
            .iter()
            .map(|n| (n.name.clone(), FirewallResult::new(&n.name)))
            .collect();
        Self {
            registry: Arc::new(registry),
            executor,
            selector,
            timeout,
            results: Arc::new(RwLock::new(results)),
        }
    }

    pub async fn add_node(&mut self, node: Node) -> Result<(), RegistryError> {
        let name = node.name.clone();
        Arc::make_mut(&mut self.registry).add_node(node)?;
        self.results
            .write()
            .await
            .insert(name.clone(), FirewallResult::new(&name));
        Ok(())
    }

    pub fn set_ssh_key_path(&mut self, path: impl Into<PathBuf>) {
        Arc::make_mut(&mut self.registry).set_ssh_key_path(path);
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Rules a registered node would receive, `None` for unknown nodes.
    pub fn rules_for(&self, node_name: &str) -> Option<Vec<FirewallRule>> {
        self.registry
            .get(node_name)
            .map(|n| self.selector.rules_for_node(n))
    }

    /// The exact script a registered node would run.
    pub fn render_script(&self, node_name: &str) -> Option<String> {
        let node = self.registry.get(node_name)?;
        Some(firewall_script::render_script(
            &node.name,
            &self.selector.rules_for_node(node),
        ))
    }

    /// Configure every node concurrently; one attempt per node.
    pub async fn configure_all_nodes(&self) -> Result<(), FirewallError> {
        let nodes = self.registry.nodes().to_vec();
        let deadline = Instant::now() + self.timeout;

        info!(
            nodes = nodes.len(),
            timeout_secs = self.timeout.as_secs(),
            "configuring OS firewalls"
        );
        if nodes.is_empty() {
            return Ok(());
        }

        let (result_tx, mut result_rx) = mpsc::channel(nodes.len());
        let (error_tx, mut error_rx) = mpsc::channel(fanout::ERROR_BUFFER);

        let mut workers = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let rules = self.selector.rules_for_node(node);
            let job = FirewallJob {
                executor: self.executor.clone(),
                target: self.registry.ssh_target(node),
                script: firewall_script::render_script(&node.name, &rules),
                node: node.name.clone(),
                rules,
                result_tx: result_tx.clone(),
                error_tx: error_tx.clone(),
            };
            workers.push((node.name.clone(), tokio::spawn(job.run())));
        }

        tokio::spawn(fanout::supervise(workers, result_tx, error_tx, |node, reason| {
            let mut result = FirewallResult::new(node);
            result.error = Some(reason);
            result.timestamp = Some(Utc::now());
            result
        }));

        let mut reported = Vec::with_capacity(nodes.len());
        let mut failed = Vec::new();
        let mut errors_open = true;

        loop {
            tokio::select! {
                biased;

                _ = time::sleep_until(deadline) => {
                    let pending: Vec<String> = nodes
                        .iter()
                        .map(|n| n.name.clone())
                        .filter(|n| !reported.contains(n))
                        .collect();
                    {
                        let mut results = self.results.write().await;
                        for name in &pending {
                            let mut result = FirewallResult::new(name);
                            result.error = Some(format!("timed out after {:?}", self.timeout));
                            result.timestamp = Some(Utc::now());
                            results.insert(name.clone(), result);
                        }
                    }
                    warn!(pending = ?pending, "timeout configuring OS firewalls");
                    self.log_summary().await;

                    let mut nodes_down = failed.clone();
                    nodes_down.extend(pending.iter().cloned());
                    return Err(FirewallError::Timeout {
                        after: self.timeout,
                        pending,
                        nodes: self.in_registry_order(nodes_down),
                    });
                }

                err = error_rx.recv(), if errors_open => match err {
                    Some(WorkerError { node, message }) => {
                        warn!(node = %node, error = %message, "firewall configuration error");
                    }
                    None => errors_open = false,
                },

                result = result_rx.recv() => {
                    let Some(result) = result else { break };
                    if result.success {
                        info!(
                            node = %result.node_name,
                            backend = ?result.backend,
                            rules = result.rules_applied.len(),
                            "firewall configured"
                        );
                    } else {
                        failed.push(result.node_name.clone());
                    }
                    reported.push(result.node_name.clone());
                    self.results
                        .write()
                        .await
                        .insert(result.node_name.clone(), result);
                }
            }
        }

        self.log_summary().await;
        if failed.is_empty() {
            info!(nodes = nodes.len(), "all OS firewalls configured");
            Ok(())
        } else {
            Err(FirewallError::Failed {
                nodes: self.in_registry_order(failed),
            })
        }
    }

    /// Snapshot of every node's result, in registration order.
    pub async fn results(&self) -> Vec<FirewallResult> {
        let results = self.results.read().await;
        self.registry
            .nodes()
            .iter()
            .filter_map(|n| results.get(&n.name).cloned())
            .collect()
    }

    pub async fn summary(&self) -> FirewallSummary {
        let mut summary = FirewallSummary::default();
        for result in self.results().await {
            if result.success {
                summary.succeeded += 1;
                let backend = result
                    .backend
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                summary.lines.push(format!(
                    "✓ {}: {} rules applied ({})",
                    result.node_name,
                    result.rules_applied.len(),
                    backend
                ));
            } else {
                summary.failed += 1;
                let error = result.error.as_deref().unwrap_or("not configured");
                summary
                    .lines
                    .push(format!("✗ {}: {}", result.node_name, error));
            }
        }
        summary
    }

    async fn log_summary(&self) {
        let summary = self.summary().await;
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "OS firewall configuration summary"
        );
        for line in &summary.lines {
            info!("{}", line);
        }
    }

    fn in_registry_order(&self, names: Vec<String>) -> Vec<String> {
        self.registry
            .nodes()
            .iter()
            .map(|n| n.name.clone())
            .filter(|n| names.contains(n))
            .collect()
    }
}

/// One node's single configuration attempt.
struct FirewallJob<E> {
    executor: Arc<E>,
    target: SshTarget,
    script: String,
    node: String,
    rules: Vec<FirewallRule>,
    result_tx: mpsc::Sender<FirewallResult>,
    error_tx: mpsc::Sender<WorkerError>,
}

impl<E: RemoteExecutor> FirewallJob<E> {
    async fn run(self) {
        info!(node = %self.node, rules = self.rules.len(), "applying firewall rules");

        let mut result = FirewallResult::new(&self.node);
        match self.executor.execute(&self.target, &self.script).await {
            Ok(output) => {
                let outcome = firewall_script::parse_output(&output);
                result.backend = outcome.backend;
                if outcome.success {
                    result.success = true;
                    result.rules_applied = self.rules;
                } else {
                    let message = outcome
                        .error
                        .unwrap_or_else(|| "script finished without reporting SUCCESS".to_string());
                    fanout::report(&self.error_tx, &self.node, message.clone());
                    result.error = Some(message);
                }
            }
            Err(e) => {
                let outcome = firewall_script::parse_output(e.stdout().unwrap_or_default());
                result.backend = outcome.backend;
                let message = match outcome.error {
                    Some(detail) => format!("{}: {}", detail, e),
                    None => e.to_string(),
                };
                fanout::report(&self.error_tx, &self.node, message.clone());
                result.error = Some(message);
            }
        }
        result.timestamp = Some(Utc::now());

        // The coordinator may already be gone.
        let _ = self.result_tx.send(result).await;
    }
}
