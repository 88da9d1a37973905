//! Low-frequency snapshot and artifact polling, plus one-shot refreshes.

use std::sync::Arc;
use std::time::Duration;

use plan_sync_core::{ArtifactDescriptor, RunId, RunSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use crate::backend::PlanBackend;
use crate::errors::BackendError;

/// Result of one fetch, delivered to the engine task.
#[derive(Debug)]
pub enum FetchResult {
    Snapshot(Result<RunSnapshot, BackendError>),
    Artifacts(Result<Vec<ArtifactDescriptor>, BackendError>),
    /// Out-of-band refresh after a sequence gap.
    Resync {
        snapshot: Result<RunSnapshot, BackendError>,
        artifacts: Result<Vec<ArtifactDescriptor>, BackendError>,
    },
}

/// Which records a one-shot refresh fetches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refresh {
    Snapshot,
    Artifacts,
    Resync,
}

/// Aborts the owned task when dropped.
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Periodic fetcher for one run.
pub struct Poller {
    backend: Arc<dyn PlanBackend>,
    snapshot_every: Duration,
    artifact_every: Duration,
}

impl Poller {
    pub fn new(backend: Arc<dyn PlanBackend>, snapshot_every: Duration, artifact_every: Duration) -> Self {
        Self {
            backend,
            snapshot_every,
            artifact_every,
        }
    }

    /// Polls both records immediately and then on their intervals until the
    /// guard is dropped or `results` closes.
    pub fn spawn(&self, run_id: RunId, results: mpsc::Sender<FetchResult>) -> TaskGuard {
        let backend = self.backend.clone();
        let mut snapshot_tick = interval(self.snapshot_every);
        let mut artifact_tick = interval(self.artifact_every);
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        artifact_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        TaskGuard(tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = snapshot_tick.tick() => {
                        debug!(event = "poller.snapshot", %run_id, "polling snapshot");
                        FetchResult::Snapshot(backend.fetch_snapshot(&run_id).await)
                    }
                    _ = artifact_tick.tick() => {
                        debug!(event = "poller.artifacts", %run_id, "polling artifacts");
                        FetchResult::Artifacts(backend.fetch_artifacts(&run_id).await)
                    }
                };
                if results.send(result).await.is_err() {
                    return;
                }
            }
        }))
    }
}

/// Runs one refresh in the background.
pub fn spawn_refresh(
    backend: Arc<dyn PlanBackend>,
    run_id: RunId,
    refresh: Refresh,
    results: mpsc::Sender<FetchResult>,
) -> TaskGuard {
    TaskGuard(tokio::spawn(async move {
        debug!(event = "poller.refresh", %run_id, refresh = ?refresh, "out-of-band refresh");
        let result = match refresh {
            Refresh::Snapshot => FetchResult::Snapshot(backend.fetch_snapshot(&run_id).await),
            Refresh::Artifacts => FetchResult::Artifacts(backend.fetch_artifacts(&run_id).await),
            Refresh::Resync => {
                let (snapshot, artifacts) =
                    tokio::join!(backend.fetch_snapshot(&run_id), backend.fetch_artifacts(&run_id));
                FetchResult::Resync {
                    snapshot,
                    artifacts,
                }
            }
        };
        let _ = results.send(result).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileContent, FrameStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        snapshots: AtomicUsize,
        artifacts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PlanBackend for CountingBackend {
        async fn fetch_snapshot(&self, run_id: &RunId) -> Result<RunSnapshot, BackendError> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            Ok(RunSnapshot::empty(run_id.clone()))
        }

        async fn fetch_artifacts(&self, _run_id: &RunId) -> Result<Vec<ArtifactDescriptor>, BackendError> {
            self.artifacts.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ArtifactDescriptor::named("plan.md", "text/markdown")])
        }

        async fn fetch_file(
            &self,
            _run_id: &RunId,
            _filename: &str,
            _max_bytes: u64,
        ) -> Result<FileContent, BackendError> {
            Err(BackendError::Transport("unused".into()))
        }

        async fn open_stream(&self, _run_id: &RunId) -> Result<FrameStream, BackendError> {
            Err(BackendError::Transport("unused".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_independent_intervals() {
        let backend = Arc::new(CountingBackend::default());
        let poller = Poller::new(backend.clone(), Duration::from_secs(3), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(16);
        let guard = poller.spawn(RunId::new("plan-1"), tx);

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        while rx.try_recv().is_ok() {}
        // t = 0, 3, 6, 9, 12, 15 and t = 0, 5, 10, 15
        assert_eq!(backend.snapshots.load(Ordering::SeqCst), 6);
        assert_eq!(backend.artifacts.load(Ordering::SeqCst), 4);

        drop(guard);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.snapshots.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn resync_fetches_both_records() {
        let backend = Arc::new(CountingBackend::default());
        let (tx, mut rx) = mpsc::channel(4);
        let _guard = spawn_refresh(backend.clone(), RunId::new("plan-1"), Refresh::Resync, tx);
        match rx.recv().await {
            Some(FetchResult::Resync {
                snapshot: Ok(snapshot),
                artifacts: Ok(artifacts),
            }) => {
                assert_eq!(snapshot.id, RunId::new("plan-1"));
                assert_eq!(artifacts.len(), 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
