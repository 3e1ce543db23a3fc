//! Plumbing shared by the per-node worker pools.
//!
//! Both coordinators spawn one task per node, collect results on an mpsc
//! channel and drain a best-effort error channel. [`supervise`] owns the last
//! senders, so the channels close once every worker has finished, and turns a
//! panicked worker into a failed result instead of a silent gap.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Capacity of the error channel. Errors beyond it are dropped.
pub(crate) const ERROR_BUFFER: usize = 64;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Non-fatal error a worker hit while it kept going.
#[derive(Debug, Clone)]
pub(crate) struct WorkerError {
    pub node: String,
    pub message: String,
}

/// Send without waiting; a full or closed channel drops the error.
pub(crate) fn report(errors: &mpsc::Sender<WorkerError>, node: &str, message: impl Into<String>) {
    let _ = errors.try_send(WorkerError {
        node: node.to_string(),
        message: message.into(),
    });
}

/// Aborts the wrapped task when dropped.
pub(crate) struct AbortOnDrop<T>(pub JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Await every worker, then drop the channel senders.
///
/// A worker that panicked or was cancelled gets `on_failure(node, reason)`
/// sent in its place.
pub(crate) async fn supervise<T, F>(
    workers: Vec<(String, JoinHandle<()>)>,
    results: mpsc::Sender<T>,
    errors: mpsc::Sender<WorkerError>,
    on_failure: F,
) where
    T: Send + 'static,
    F: Fn(&str, String) -> T,
{
    for (node, handle) in workers {
        if let Err(e) = handle.await {
            let reason = format!("worker failed: {}", e);
            warn!(node = %node, error = %e, "node worker did not finish");
            report(&errors, &node, reason.clone());
            let _ = results.send(on_failure(&node, reason)).await;
        }
    }
}

/// Interval periods must be non-zero.
pub(crate) fn period(d: Duration) -> Duration {
    d.max(MIN_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channels_close_after_all_workers_finish() {
        let (tx, mut rx) = mpsc::channel::<String>(4);
        let (etx, mut erx) = mpsc::channel(ERROR_BUFFER);

        let ok_tx = tx.clone();
        let ok = tokio::spawn(async move {
            let _ = ok_tx.send("a:done".to_string()).await;
        });
        let boom = tokio::spawn(async {
            panic!("probe exploded");
        });

        tokio::spawn(supervise(
            vec![("a".to_string(), ok), ("b".to_string(), boom)],
            tx,
            etx,
            |node, reason| format!("{}:{}", node, reason),
        ));

        let mut got = Vec::new();
        while let Some(r) = rx.recv().await {
            got.push(r);
        }
        assert_eq!(got.len(), 2);
        assert!(got.contains(&"a:done".to_string()));
        assert!(got.iter().any(|r| r.starts_with("b:worker failed")));

        let err = erx.recv().await.unwrap();
        assert_eq!(err.node, "b");
        assert!(erx.recv().await.is_none());
    }

    #[test]
    fn zero_periods_are_clamped() {
        assert_eq!(period(Duration::ZERO), MIN_PERIOD);
        assert_eq!(period(Duration::from_secs(5)), Duration::from_secs(5));
    }
}
