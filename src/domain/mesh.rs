//! Full-mesh VPN verification.
//!
//! One worker per node probes every peer over the WireGuard overlay from that
//! node, re-probing on a fixed interval until all of its peers answer or the
//! run deadline passes. The coordinator merges finished results into the shared
//! map and decides the outcome:
//!
//! - every worker reported fully connected: `Ok(())`
//! - the deadline passed first: [`MeshError::Timeout`] naming unresolved pairs
//! - all workers reported but some failed: [`MeshError::Unconverged`]
//!
//! Workers are cancelled cooperatively. An in-flight probe runs to completion
//! and the worker stops at its next suspension point.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::error::{MeshError, RegistryError};
use super::fanout::{self, AbortOnDrop, WorkerError};
use super::node::{Node, NodeRegistry};
use super::probe::ConnectivityProbe;
use super::remote::{RemoteExecutor, SshTarget};
use super::types::{ConnectionStatus, ConnectivityResult};

/// `source -> target -> connected`, rows for every registered node.
pub type ConnectivityMatrix = BTreeMap<String, BTreeMap<String, bool>>;

type SharedResults = Arc<RwLock<HashMap<String, ConnectivityResult>>>;

/// Timing knobs for a verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSettings {
    /// Pause between probing passes of one worker.
    pub check_interval: Duration,
    /// Overall deadline for a run.
    pub timeout: Duration,
    /// How often progress is logged.
    pub status_interval: Duration,
    /// Poll period of [`MeshVerifier::wait_for_tunnels`].
    pub tunnel_poll_interval: Duration,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
            status_interval: Duration::from_secs(15),
            tunnel_poll_interval: Duration::from_secs(10),
        }
    }
}

pub struct MeshVerifier<E> {
    registry: Arc<NodeRegistry>,
    executor: Arc<E>,
    probe: ConnectivityProbe,
    settings: MeshSettings,
    results: SharedResults,
}

impl<E: RemoteExecutor> MeshVerifier<E> {
    pub fn new(executor: Arc<E>, settings: MeshSettings) -> Self {
        Self::with_registry(executor, settings, NodeRegistry::new())
    }

    /// Build a verifier over an already populated registry.
    pub fn with_registry(executor: Arc<E>, settings: MeshSettings, registry: NodeRegistry) -> Self {
        let results = registry
            .nodes()
            .iter()
            .map(|n| (n.name.clone(), ConnectivityResult::new(&n.name)))
            .collect();
        Self {
            registry: Arc::new(registry),
            executor,
            probe: ConnectivityProbe::default(),
            settings,
            results: Arc::new(RwLock::new(results)),
        }
    }

    pub fn with_probe(mut self, probe: ConnectivityProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Register a node and give it an empty result entry.
    pub async fn add_node(&mut self, node: Node) -> Result<(), RegistryError> {
        let name = node.name.clone();
        Arc::make_mut(&mut self.registry).add_node(node)?;
        self.results
            .write()
            .await
            .insert(name.clone(), ConnectivityResult::new(&name));
        Ok(())
    }

    pub fn set_ssh_key_path(&mut self, path: impl Into<PathBuf>) {
        Arc::make_mut(&mut self.registry).set_ssh_key_path(path);
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &MeshSettings {
        &self.settings
    }

    /// Probe every ordered pair of nodes until all connect or the deadline passes.
    pub async fn verify_full_mesh(&self) -> Result<(), MeshError> {
        let started = Instant::now();
        let timeout = self.settings.timeout;
        let deadline = started + timeout;
        let nodes = self.registry.nodes().to_vec();

        info!(
            nodes = nodes.len(),
            timeout_secs = timeout.as_secs(),
            "starting VPN full mesh connectivity verification"
        );
        match nodes.as_slice() {
            [] => {
                warn!("no nodes registered, nothing to verify");
                return Ok(());
            }
            [only] => warn!(node = %only.name, "single node has no peers, mesh is trivially connected"),
            _ => {}
        }

        let (result_tx, mut result_rx) = mpsc::channel(nodes.len());
        let (error_tx, mut error_rx) = mpsc::channel(fanout::ERROR_BUFFER);

        let _reporter = AbortOnDrop(tokio::spawn(report_status(
            self.results.clone(),
            self.registry.clone(),
            self.settings.status_interval,
            deadline,
        )));

        let mut workers = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let worker = ProbeWorker {
                executor: self.executor.clone(),
                registry: self.registry.clone(),
                probe: self.probe.clone(),
                results: self.results.clone(),
                check_interval: self.settings.check_interval,
                deadline,
                result_tx: result_tx.clone(),
                error_tx: error_tx.clone(),
            };
            workers.push((node.name.clone(), tokio::spawn(worker.run(node.clone()))));
        }

        tokio::spawn(fanout::supervise(workers, result_tx, error_tx, |node, reason| {
            let mut result = ConnectivityResult::new(node);
            result.error = Some(reason);
            result.timestamp = Some(Utc::now());
            result
        }));

        let mut failed_pairs = Vec::new();
        let mut errors_open = true;

        loop {
            tokio::select! {
                biased;

                _ = time::sleep_until(deadline) => {
                    let unresolved = self.unresolved_pairs().await;
                    warn!(
                        unresolved = unresolved.len(),
                        "timeout waiting for VPN connectivity verification"
                    );
                    return Err(MeshError::Timeout { after: timeout, unresolved });
                }

                err = error_rx.recv(), if errors_open => match err {
                    Some(WorkerError { node, message }) => {
                        warn!(node = %node, error = %message, "connectivity check error");
                    }
                    None => errors_open = false,
                },

                result = result_rx.recv() => {
                    let Some(result) = result else { break };
                    info!(
                        node = %result.source_node,
                        connected = result.connected_count(),
                        peers = nodes.len() - 1,
                        all_connected = result.all_connected,
                        "node verification finished"
                    );
                    failed_pairs.extend(self.pending_pairs(&result));
                    self.results
                        .write()
                        .await
                        .insert(result.source_node.clone(), result);
                }
            }
        }

        if failed_pairs.is_empty() {
            info!(
                nodes = nodes.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "VPN full mesh connectivity verified"
            );
            Ok(())
        } else {
            warn!(failed = failed_pairs.len(), "VPN connectivity verification failed");
            Err(MeshError::Unconverged { pairs: failed_pairs })
        }
    }

    /// Current view of who reaches whom. Diagonal entries are never present.
    pub async fn connectivity_matrix(&self) -> ConnectivityMatrix {
        let results = self.results.read().await;
        self.registry
            .nodes()
            .iter()
            .map(|node| {
                let row = results
                    .get(&node.name)
                    .map(|r| {
                        r.connections
                            .iter()
                            .filter(|(target, _)| **target != node.name)
                            .map(|(target, c)| (target.clone(), c.is_connected))
                            .collect()
                    })
                    .unwrap_or_default();
                (node.name.clone(), row)
            })
            .collect()
    }

    /// Snapshot of every node's result, in registration order.
    pub async fn results(&self) -> Vec<ConnectivityResult> {
        let results = self.results.read().await;
        self.registry
            .nodes()
            .iter()
            .filter_map(|n| results.get(&n.name).cloned())
            .collect()
    }

    /// Tab-separated matrix for terminals. Names are cut to six characters.
    pub async fn render_matrix(&self) -> String {
        let results = self.results.read().await;
        let names: Vec<&str> = self.registry.nodes().iter().map(|n| n.name.as_str()).collect();

        let mut out = String::from("VPN Connectivity Matrix:\n");
        out.push_str("Source\\Target");
        for name in &names {
            out.push('\t');
            out.push_str(&short_name(name));
        }
        out.push('\n');

        for source in &names {
            out.push_str(&short_name(source));
            for target in &names {
                let cell = if source == target {
                    "---".to_string()
                } else {
                    match results.get(*source).and_then(|r| r.connections.get(*target)) {
                        Some(c) if c.is_connected => format!("✓({}ms)", c.latency.as_millis()),
                        Some(_) => "✗".to_string(),
                        None => "?".to_string(),
                    }
                };
                out.push('\t');
                out.push_str(&cell);
            }
            out.push('\n');
        }
        out
    }

    /// Poll every node until its WireGuard interface is configured and running.
    pub async fn wait_for_tunnels(&self) -> Result<(), MeshError> {
        let timeout = self.settings.timeout;
        let deadline = Instant::now() + timeout;
        let mut pending: Vec<String> = self.registry.nodes().iter().map(|n| n.name.clone()).collect();

        let mut ticker = time::interval(fanout::period(self.settings.tunnel_poll_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(nodes = pending.len(), interface = self.probe.interface(), "waiting for WireGuard tunnels");
        loop {
            tokio::select! {
                biased;
                _ = time::sleep_until(deadline) => {
                    warn!(pending = ?pending, "timeout waiting for WireGuard tunnels");
                    return Err(MeshError::TunnelTimeout { after: timeout, pending });
                }
                _ = ticker.tick() => {}
            }

            let mut checks = JoinSet::new();
            for node in self.registry.nodes().iter().filter(|n| pending.contains(&n.name)) {
                let executor = self.executor.clone();
                let target = self.registry.ssh_target(node);
                let script = self.probe.readiness_script();
                let name = node.name.clone();
                checks.spawn(async move {
                    let ready = match executor.execute(&target, &script).await {
                        Ok(out) => {
                            let readiness = ConnectivityProbe::parse_readiness(&out);
                            debug!(node = %name, ready = readiness.ready, peers = ?readiness.peer_count, "readiness check");
                            readiness.ready
                        }
                        Err(e) => {
                            debug!(node = %name, error = %e, "readiness check failed");
                            false
                        }
                    };
                    (name, ready)
                });
            }

            while let Some(joined) = checks.join_next().await {
                match joined {
                    Ok((name, true)) => {
                        debug!(node = %name, "WireGuard tunnel ready");
                        pending.retain(|n| *n != name);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "readiness check task failed"),
                }
            }

            if pending.is_empty() {
                info!("all WireGuard tunnels are ready");
                return Ok(());
            }
            info!(pending = ?pending, "WireGuard tunnels not ready yet");
        }
    }

    /// `source -> target` pairs from `result` that are not connected.
    fn pending_pairs(&self, result: &ConnectivityResult) -> Vec<String> {
        self.registry
            .peers_of(&result.source_node)
            .filter(|peer| {
                !result
                    .connections
                    .get(&peer.name)
                    .is_some_and(|c| c.is_connected)
            })
            .map(|peer| format!("{} -> {}", result.source_node, peer.name))
            .collect()
    }

    async fn unresolved_pairs(&self) -> Vec<String> {
        let results = self.results.read().await;
        self.registry
            .nodes()
            .iter()
            .flat_map(|node| match results.get(&node.name) {
                Some(result) => self.pending_pairs(result),
                None => self.pending_pairs(&ConnectivityResult::new(&node.name)),
            })
            .collect()
    }
}

fn short_name(name: &str) -> String {
    name.chars().take(6).collect()
}

// ── Worker ─────────────────────────────────────────────────

/// Probes all peers of one source node.
struct ProbeWorker<E> {
    executor: Arc<E>,
    registry: Arc<NodeRegistry>,
    probe: ConnectivityProbe,
    results: SharedResults,
    check_interval: Duration,
    deadline: Instant,
    result_tx: mpsc::Sender<ConnectivityResult>,
    error_tx: mpsc::Sender<WorkerError>,
}

impl<E: RemoteExecutor> ProbeWorker<E> {
    async fn run(self, source: Node) {
        let peers: Vec<Node> = self.registry.peers_of(&source.name).cloned().collect();
        let target = self.registry.ssh_target(&source);
        let mut result = ConnectivityResult::new(&source.name);

        let mut ticker = time::interval(fanout::period(self.check_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = time::sleep_until(self.deadline) => break,
                _ = ticker.tick() => {}
            }

            for peer in &peers {
                let connected = result
                    .connections
                    .get(&peer.name)
                    .is_some_and(|c| c.is_connected);

                if connected {
                    if let Some(conn) = result.connections.get_mut(&peer.name) {
                        self.refresh_stats(&target, &source.name, conn).await;
                    }
                } else {
                    let conn = self.check_peer(&target, &source.name, peer).await;
                    result.connections.insert(peer.name.clone(), conn);
                }

                if Instant::now() >= self.deadline {
                    break;
                }
            }

            result.recompute(peers.len());
            result.timestamp = Some(Utc::now());
            self.publish(&result).await;

            if result.all_connected {
                debug!(node = %source.name, peers = peers.len(), "all peers connected");
                break;
            }
            if Instant::now() >= self.deadline {
                break;
            }
            debug!(
                node = %source.name,
                connected = result.connected_count(),
                peers = peers.len(),
                "peers still unreachable, retrying"
            );
        }

        // The coordinator may already be gone.
        let _ = self.result_tx.send(result).await;
    }

    async fn check_peer(&self, target: &SshTarget, source: &str, peer: &Node) -> ConnectionStatus {
        let mut status = ConnectionStatus::new(&peer.name, &peer.wireguard_ip);
        status.last_check = Some(Utc::now());

        let script = self.probe.build_script(&peer.wireguard_ip);
        match self.executor.execute(target, &script).await {
            Ok(output) => self.probe.parse_output(&output).apply_to(&mut status),
            Err(e) => {
                let stdout = e.stdout().unwrap_or_default();
                self.probe.parse_output(stdout).apply_to(&mut status);
                status.is_connected = false;

                let message = match error_line(stdout) {
                    Some(detail) => format!("{}: {}", detail, e),
                    None => e.to_string(),
                };
                fanout::report(&self.error_tx, source, format!("{} -> {}: {}", source, peer.name, message));
                status.error = Some(message);
            }
        }
        status
    }

    /// Refresh counters for a peer that already answered; never demotes it.
    async fn refresh_stats(&self, target: &SshTarget, source: &str, conn: &mut ConnectionStatus) {
        let script = self.probe.stats_script(&conn.target_ip);
        match self.executor.execute(target, &script).await {
            Ok(output) => {
                if let Some(stats) = self.probe.parse_stats(&output) {
                    conn.wireguard = Some(stats);
                }
                conn.last_check = Some(Utc::now());
                conn.error = None;
            }
            Err(e) => {
                fanout::report(&self.error_tx, source, format!("stats refresh for {}: {}", conn.target_node, e));
                conn.error = Some(e.to_string());
            }
        }
    }

    async fn publish(&self, result: &ConnectivityResult) {
        if Instant::now() < self.deadline {
            self.results
                .write()
                .await
                .insert(result.source_node.clone(), result.clone());
        }
    }
}

fn error_line(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|l| l.trim().strip_prefix("ERROR:"))
        .map(str::trim)
}

async fn report_status(
    results: SharedResults,
    registry: Arc<NodeRegistry>,
    every: Duration,
    deadline: Instant,
) {
    let every = fanout::period(every);
    let mut ticker = time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => return,
            _ = ticker.tick() => {}
        }

        let snapshot = results.read().await;
        let converged = snapshot.values().filter(|r| r.all_connected).count();
        info!(converged, total = registry.len(), "VPN mesh verification progress");
        for node in registry.nodes() {
            if let Some(result) = snapshot.get(&node.name) {
                debug!(
                    node = %node.name,
                    connected = result.connected_count(),
                    peers = registry.len().saturating_sub(1),
                    "node progress"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::domain::error::ExecError;

    const PROBE_OK: &str = "PING_STATUS:SUCCESS\nPACKET_LOSS:0\nAVG_LATENCY:0.5\nHANDSHAKE:ACTIVE\n";
    const PROBE_FAILED: &str = "PING_STATUS:FAILED\nPACKET_LOSS:100\nHANDSHAKE:NONE\n";
    const STATS: &str = "PEER_KEY:abc=\nENDPOINT:192.0.2.9:51820\nLATEST_HANDSHAKE:1700000000\nTRANSFER_RX:10\nTRANSFER_TX:20\nKEEPALIVE:25\n";

    fn node(i: u8, name: &str) -> Node {
        Node::new(name, &format!("192.0.2.{}", i), &format!("10.8.0.{}", i))
    }

    fn fast(timeout: Duration) -> MeshSettings {
        MeshSettings {
            check_interval: Duration::from_millis(10),
            timeout,
            status_interval: Duration::from_millis(50),
            tunnel_poll_interval: Duration::from_millis(10),
        }
    }

    fn target_ip(script: &str) -> String {
        script
            .split("TARGET_IP=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap_or_default()
            .to_string()
    }

    async fn verifier<E: RemoteExecutor>(exec: E, settings: MeshSettings, names: &[&str]) -> MeshVerifier<E> {
        let mut v = MeshVerifier::new(Arc::new(exec), settings);
        for (i, name) in names.iter().enumerate() {
            v.add_node(node(i as u8 + 1, name)).await.unwrap();
        }
        v
    }

    /// Every probe succeeds.
    #[derive(Default)]
    struct Healthy {
        probes: AtomicUsize,
        stats: AtomicUsize,
    }

    impl RemoteExecutor for Healthy {
        async fn execute(&self, _target: &SshTarget, script: &str) -> Result<String, ExecError> {
            if script.contains("\"PEER_KEY:\"") {
                self.stats.fetch_add(1, Ordering::SeqCst);
                return Ok(STATS.to_string());
            }
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(PROBE_OK.to_string())
        }
    }

    /// Every probe fails at the ping stage.
    struct Unreachable;

    impl RemoteExecutor for Unreachable {
        async fn execute(&self, _target: &SshTarget, _script: &str) -> Result<String, ExecError> {
            Ok(PROBE_FAILED.to_string())
        }
    }

    /// Each (source host, target ip) pair fails its first `failures` probes.
    struct Flaky {
        failures: usize,
        attempts: Mutex<HashMap<(String, String), usize>>,
        stats: AtomicUsize,
    }

    impl RemoteExecutor for Flaky {
        async fn execute(&self, target: &SshTarget, script: &str) -> Result<String, ExecError> {
            if script.contains("\"PEER_KEY:\"") {
                self.stats.fetch_add(1, Ordering::SeqCst);
                return Ok(STATS.to_string());
            }
            let key = (target.host.clone(), target_ip(script));
            let mut attempts = self.attempts.lock().unwrap();
            let seen = attempts.entry(key).or_insert(0);
            *seen += 1;
            if *seen > self.failures {
                Ok(PROBE_OK.to_string())
            } else {
                Ok(PROBE_FAILED.to_string())
            }
        }
    }

    #[tokio::test]
    async fn converges_and_fills_the_matrix() {
        let names = ["master-1", "worker-1", "worker-2", "worker-3"];
        let v = verifier(Healthy::default(), fast(Duration::from_secs(5)), &names).await;

        v.verify_full_mesh().await.unwrap();

        let matrix = v.connectivity_matrix().await;
        assert_eq!(matrix.len(), 4);
        for (source, row) in &matrix {
            assert_eq!(row.len(), 3, "row for {}", source);
            assert!(!row.contains_key(source));
            assert!(row.values().all(|c| *c));
        }
        assert!(v.results().await.iter().all(|r| r.all_connected));
    }

    #[tokio::test]
    async fn flaky_pairs_converge_on_retry() {
        let exec = Flaky {
            failures: 1,
            attempts: Mutex::new(HashMap::new()),
            stats: AtomicUsize::new(0),
        };
        let v = verifier(exec, fast(Duration::from_secs(5)), &["a", "b", "c"]).await;

        v.verify_full_mesh().await.unwrap();

        let results = v.results().await;
        let a = results.iter().find(|r| r.source_node == "a").unwrap();
        let b = &a.connections["b"];
        assert!(b.is_connected);
        assert_eq!(b.latency, Duration::from_micros(500));
        assert_eq!(b.wireguard.as_ref().and_then(|w| w.public_key.as_deref()), None);

        // every pair failed once, so each node needed exactly two probing passes
        assert_eq!(v.executor.attempts.lock().unwrap().values().sum::<usize>(), 12);
        assert_eq!(v.executor.stats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn times_out_naming_every_unresolved_pair() {
        let v = verifier(Unreachable, fast(Duration::from_millis(300)), &["a", "b", "c"]).await;

        let started = Instant::now();
        let err = v.verify_full_mesh().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(3));
        match err {
            MeshError::Timeout { unresolved, .. } => {
                assert_eq!(unresolved.len(), 6);
                assert!(unresolved.contains(&"a -> b".to_string()));
                assert!(unresolved.contains(&"c -> a".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }

        let matrix = v.connectivity_matrix().await;
        assert!(matrix.values().flat_map(|row| row.values()).all(|c| !*c));
    }

    #[tokio::test]
    async fn transport_errors_are_kept_on_the_connection() {
        struct NoInterface;
        impl RemoteExecutor for NoInterface {
            async fn execute(&self, target: &SshTarget, _script: &str) -> Result<String, ExecError> {
                Err(ExecError::NonZeroExit {
                    host: target.host.clone(),
                    status: "exit status: 1".to_string(),
                    stdout: "=== VPN Connectivity Check ===\nERROR: WireGuard interface wg0 not found\n".to_string(),
                    stderr: String::new(),
                })
            }
        }

        let v = verifier(NoInterface, fast(Duration::from_millis(150)), &["a", "b"]).await;
        assert!(v.verify_full_mesh().await.unwrap_err().is_timeout());

        let results = v.results().await;
        let conn = &results[0].connections["b"];
        assert!(!conn.is_connected);
        assert_eq!(conn.packet_loss, 100.0);
        assert!(conn
            .error
            .as_deref()
            .unwrap()
            .starts_with("WireGuard interface wg0 not found"));
    }

    #[tokio::test]
    async fn stats_refresh_keeps_connected_peers_fresh() {
        // b never reaches c, so a keeps looping and refreshes its good peers
        struct Partial {
            stats: AtomicUsize,
        }
        impl RemoteExecutor for Partial {
            async fn execute(&self, target: &SshTarget, script: &str) -> Result<String, ExecError> {
                if script.contains("\"PEER_KEY:\"") {
                    self.stats.fetch_add(1, Ordering::SeqCst);
                    return Ok(STATS.to_string());
                }
                if target.host == "192.0.2.2" && target_ip(script) == "10.8.0.3" {
                    return Ok(PROBE_FAILED.to_string());
                }
                Ok(PROBE_OK.to_string())
            }
        }

        let v = verifier(
            Partial { stats: AtomicUsize::new(0) },
            fast(Duration::from_millis(200)),
            &["a", "b", "c"],
        )
        .await;
        let err = v.verify_full_mesh().await.unwrap_err();
        match err {
            MeshError::Timeout { unresolved, .. } => assert_eq!(unresolved, vec!["b -> c".to_string()]),
            other => panic!("unexpected error: {other}"),
        }

        assert!(v.executor.stats.load(Ordering::SeqCst) > 0);
        let results = v.results().await;
        let b = results.iter().find(|r| r.source_node == "b").unwrap();
        let to_a = &b.connections["a"];
        assert!(to_a.is_connected);
        assert_eq!(
            to_a.wireguard.as_ref().and_then(|w| w.public_key.as_deref()),
            Some("abc=")
        );
        assert!(!b.all_connected);
    }

    #[tokio::test]
    async fn panicked_worker_is_reported_as_unconverged() {
        struct PanicsOnC;
        impl RemoteExecutor for PanicsOnC {
            async fn execute(&self, target: &SshTarget, _script: &str) -> Result<String, ExecError> {
                if target.host == "192.0.2.3" {
                    panic!("ssh client crashed");
                }
                Ok(PROBE_OK.to_string())
            }
        }

        let v = verifier(PanicsOnC, fast(Duration::from_secs(5)), &["a", "b", "c"]).await;
        let err = v.verify_full_mesh().await.unwrap_err();
        match err {
            MeshError::Unconverged { pairs } => {
                assert_eq!(pairs, vec!["c -> a".to_string(), "c -> b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let results = v.results().await;
        let c = results.iter().find(|r| r.source_node == "c").unwrap();
        assert!(c.error.as_deref().unwrap().contains("worker failed"));
    }

    #[tokio::test]
    async fn single_node_is_trivially_connected() {
        let exec = Healthy::default();
        let v = verifier(exec, fast(Duration::from_secs(1)), &["solo"]).await;

        v.verify_full_mesh().await.unwrap();

        assert_eq!(v.executor.probes.load(Ordering::SeqCst), 0);
        let matrix = v.connectivity_matrix().await;
        assert_eq!(matrix.len(), 1);
        assert!(matrix["solo"].is_empty());
    }

    #[tokio::test]
    async fn empty_registry_verifies_immediately() {
        let v = verifier(Unreachable, fast(Duration::from_secs(1)), &[]).await;
        v.verify_full_mesh().await.unwrap();
        assert!(v.connectivity_matrix().await.is_empty());
    }

    #[tokio::test]
    async fn matrix_exists_before_any_run() {
        let v = verifier(Unreachable, fast(Duration::from_secs(1)), &["alpha-node", "beta"]).await;

        let matrix = v.connectivity_matrix().await;
        assert_eq!(matrix.len(), 2);
        assert!(matrix.values().all(|row| row.is_empty()));

        let rendered = v.render_matrix().await;
        assert!(rendered.contains("alpha-"));
        assert!(!rendered.contains("alpha-node"));
        assert!(rendered.contains("---"));
        assert!(rendered.contains('?'));
    }

    #[tokio::test]
    async fn render_marks_connections() {
        let v = verifier(Healthy::default(), fast(Duration::from_secs(5)), &["a", "b"]).await;
        v.verify_full_mesh().await.unwrap();

        let rendered = v.render_matrix().await;
        assert!(rendered.contains("✓(0ms)"));
        assert!(!rendered.contains('✗'));
        assert_eq!(rendered.lines().count(), 4);
    }

    #[tokio::test]
    async fn duplicate_nodes_are_rejected() {
        let mut v = verifier(Unreachable, fast(Duration::from_secs(1)), &["a"]).await;
        assert!(v.add_node(node(9, "a")).await.is_err());
        assert_eq!(v.registry().len(), 1);
    }

    #[tokio::test]
    async fn tunnels_ready() {
        struct Ready;
        impl RemoteExecutor for Ready {
            async fn execute(&self, _t: &SshTarget, _s: &str) -> Result<String, ExecError> {
                Ok("WIREGUARD:READY\nPEER_COUNT:2\n".to_string())
            }
        }
        let v = verifier(Ready, fast(Duration::from_secs(1)), &["a", "b", "c"]).await;
        v.wait_for_tunnels().await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_timeout_names_pending_nodes() {
        struct BDown;
        impl RemoteExecutor for BDown {
            async fn execute(&self, target: &SshTarget, _s: &str) -> Result<String, ExecError> {
                if target.host == "192.0.2.2" {
                    Ok("WIREGUARD:NOT_READY\n".to_string())
                } else {
                    Ok("WIREGUARD:READY\nPEER_COUNT:2\n".to_string())
                }
            }
        }
        let v = verifier(BDown, fast(Duration::from_millis(100)), &["a", "b", "c"]).await;
        match v.wait_for_tunnels().await.unwrap_err() {
            MeshError::TunnelTimeout { pending, .. } => assert_eq!(pending, vec!["b".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }
}
