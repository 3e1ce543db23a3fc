//! Remote execution: the only way the coordinators touch a node.
//!
//! [`RemoteExecutor`] runs a shell script on a host and returns its stdout.
//! [`SshExecutor`] is the production implementation and shells out to the
//! system `ssh` client.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::error::ExecError;

/// Connection material for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Executes a script on a remote host and returns captured stdout.
///
/// Implementations may skip re-running a script that is byte-identical to one
/// they already ran for the same target; callers must not depend on side
/// effects beyond what the script prints.
pub trait RemoteExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        target: &SshTarget,
        script: &str,
    ) -> impl Future<Output = Result<String, ExecError>> + Send;
}

/// Runs scripts through `ssh ... bash -s`, feeding the script on stdin.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }

    fn command(&self, target: &SshTarget) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            &format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p",
            &target.port.to_string(),
        ]);
        if let Some(key) = &target.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(target.destination())
            .args(["bash", "-s"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl RemoteExecutor for SshExecutor {
    async fn execute(&self, target: &SshTarget, script: &str) -> Result<String, ExecError> {
        debug!(host = %target.host, port = target.port, "running remote script");

        let mut child = self.command(target).spawn().map_err(|e| ExecError::Spawn {
            host: target.host.clone(),
            message: e.to_string(),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // ssh may exit before reading stdin (auth failure); its exit status
            // carries the real error, so a broken pipe here is only logged.
            if let Err(e) = stdin.write_all(script.as_bytes()).await {
                debug!(host = %target.host, error = %e, "failed to write script to ssh stdin");
            }
        }

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::TimedOut {
                host: target.host.clone(),
                after: self.command_timeout,
            })?
            .map_err(|e| ExecError::Other(format!("waiting for ssh to {}: {}", target.host, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            Err(ExecError::non_zero(&target.host, output.status, stdout, stderr))
        }
    }
}
