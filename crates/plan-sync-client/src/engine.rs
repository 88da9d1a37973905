//! Engine facade: one task owns all run state and publishes a read-only view.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use plan_sync_core::state::{EngineView, Reaction, SyncState, TransportEvent};
use plan_sync_core::{ArtifactDescriptor, RunId, RunSnapshot, SyncConfig};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::backend::PlanBackend;
use crate::errors::{BackendError, EngineError};
use crate::poller::{FetchResult, Poller, Refresh, TaskGuard, spawn_refresh};
use crate::preview::{PreviewResult, PreviewService};
use crate::transport::{TransportAdapter, TransportHandle};

const COMMAND_BUFFER: usize = 32;
const TRANSPORT_BUFFER: usize = 256;
const FETCH_BUFFER: usize = 16;
const PREVIEW_BUFFER: usize = 4;
const LIVENESS_TICK: Duration = Duration::from_secs(1);

/// Entry point for starting a sync engine.
pub struct PlanSyncEngine;

impl PlanSyncEngine {
    pub fn builder(backend: Arc<dyn PlanBackend>) -> EngineBuilder {
        EngineBuilder {
            backend,
            config: SyncConfig::default(),
        }
    }
}

pub struct EngineBuilder {
    backend: Arc<dyn PlanBackend>,
    config: SyncConfig,
}

impl EngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and spawns the engine task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<EngineHandle, EngineError> {
        self.config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view_rx) = watch::channel(EngineView::default());
        let (preview_tx, preview_rx) = mpsc::channel(PREVIEW_BUFFER);
        let task = EngineTask {
            transport: TransportAdapter::new(self.backend.clone(), self.config.reconnect.clone()),
            poller: Poller::new(
                self.backend.clone(),
                self.config.snapshot_poll_interval(),
                self.config.artifact_poll_interval(),
            ),
            preview: PreviewService::new(self.backend.clone(), self.config.preview_max_bytes),
            backend: self.backend,
            state: SyncState::new(self.config),
            commands: command_rx,
            view_tx,
            preview_tx,
            preview_rx,
            run: None,
            transport_rx: None,
            fetch_rx: None,
        };
        tokio::spawn(task.run());
        Ok(EngineHandle {
            commands: command_tx,
            view: view_rx,
        })
    }
}

enum Command {
    WatchRun(RunId),
    ClearRun,
    Refresh(Refresh),
    SelectPreview(Option<ArtifactDescriptor>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<EngineView>,
}

impl EngineHandle {
    /// Switches to `run_id`. Everything known about the previous run is discarded.
    pub async fn watch_run(&self, run_id: impl Into<RunId>) -> Result<(), EngineError> {
        let run_id = run_id.into();
        if run_id.as_str().trim().is_empty() {
            return Err(EngineError::Validation("run id must not be empty".to_string()));
        }
        self.send(Command::WatchRun(run_id)).await
    }

    /// Stops watching without starting another run.
    pub async fn clear_run(&self) -> Result<(), EngineError> {
        self.send(Command::ClearRun).await
    }

    pub async fn refresh_snapshot(&self) -> Result<(), EngineError> {
        self.send(Command::Refresh(Refresh::Snapshot)).await
    }

    pub async fn refresh_artifacts(&self) -> Result<(), EngineError> {
        self.send(Command::Refresh(Refresh::Artifacts)).await
    }

    /// Selects an artifact for preview; `None` clears the selection.
    pub async fn select_preview(&self, artifact: Option<ArtifactDescriptor>) -> Result<(), EngineError> {
        self.send(Command::SelectPreview(artifact)).await
    }

    /// Latest published view.
    pub fn view(&self) -> EngineView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every published view.
    pub fn subscribe(&self) -> watch::Receiver<EngineView> {
        self.view.clone()
    }

    /// Stops the engine and every task it owns.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Shutdown(ack_tx)).await?;
        ack_rx.await.map_err(|_| EngineError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

/// Background tasks of the watched run. Dropping this cancels them.
struct RunTasks {
    run_id: RunId,
    _transport: TransportHandle,
    poller: Option<TaskGuard>,
    refreshes: Vec<TaskGuard>,
    fetch_tx: mpsc::Sender<FetchResult>,
    resync_pending: bool,
}

struct EngineTask {
    backend: Arc<dyn PlanBackend>,
    transport: TransportAdapter,
    poller: Poller,
    preview: PreviewService,
    state: SyncState,
    commands: mpsc::Receiver<Command>,
    view_tx: watch::Sender<EngineView>,
    preview_tx: mpsc::Sender<PreviewResult>,
    preview_rx: mpsc::Receiver<PreviewResult>,
    run: Option<RunTasks>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,
    fetch_rx: Option<mpsc::Receiver<FetchResult>>,
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl EngineTask {
    async fn run(mut self) {
        let mut liveness = interval_at(Instant::now() + LIVENESS_TICK, LIVENESS_TICK);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(event = "engine.started", "sync engine started");

        loop {
            let changed = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.commands.close();
                        self.stop_run();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = recv_or_pending(&mut self.transport_rx) => match event {
                    Some(event) => self.on_transport(event),
                    None => {
                        self.transport_rx = None;
                        false
                    }
                },
                result = recv_or_pending(&mut self.fetch_rx) => match result {
                    Some(result) => self.on_fetch(result),
                    None => {
                        self.fetch_rx = None;
                        false
                    }
                },
                Some(result) = self.preview_rx.recv() => self.on_preview(result),
                _ = liveness.tick() => self.liveness_changed(),
            };
            if changed {
                self.publish();
            }
        }
        info!(event = "engine.stopped", "sync engine stopped");
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.state.view(Utc::now()));
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::WatchRun(run_id) => {
                self.start_run(run_id);
                true
            }
            Command::ClearRun => {
                self.stop_run();
                self.preview.reset();
                self.state.clear();
                true
            }
            Command::Refresh(refresh) => {
                self.spawn_refresh(refresh);
                false
            }
            Command::SelectPreview(artifact) => {
                let preview = self
                    .preview
                    .select(self.state.run_id(), artifact, &self.preview_tx);
                self.state.set_preview(preview);
                true
            }
            Command::Shutdown(_) => false,
        }
    }

    fn start_run(&mut self, run_id: RunId) {
        self.stop_run();
        self.preview.reset();
        self.state.watch(run_id.clone());

        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_BUFFER);
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_BUFFER);
        let transport = self.transport.connect(run_id.clone(), transport_tx);
        let poller = self.poller.spawn(run_id.clone(), fetch_tx.clone());
        info!(event = "engine.watch", run_id = %run_id, "watching run");
        self.run = Some(RunTasks {
            run_id,
            _transport: transport,
            poller: Some(poller),
            refreshes: Vec::new(),
            fetch_tx,
            resync_pending: false,
        });
        self.transport_rx = Some(transport_rx);
        self.fetch_rx = Some(fetch_rx);
    }

    fn stop_run(&mut self) {
        if let Some(run) = self.run.take() {
            debug!(event = "engine.stop_run", run_id = %run.run_id, "cancelling run tasks");
        }
        self.transport_rx = None;
        self.fetch_rx = None;
    }

    fn spawn_refresh(&mut self, refresh: Refresh) {
        let Some(run) = self.run.as_mut() else {
            debug!(event = "engine.refresh_without_run", refresh = ?refresh, "no run watched; ignoring refresh");
            return;
        };
        run.refreshes.retain(|guard| !guard.is_finished());
        run.refreshes.push(spawn_refresh(
            self.backend.clone(),
            run.run_id.clone(),
            refresh,
            run.fetch_tx.clone(),
        ));
    }

    fn react(&mut self, reaction: Reaction) {
        if reaction.resync
            && let Some(run) = self.run.as_mut()
            && !run.resync_pending
        {
            run.resync_pending = true;
            self.spawn_refresh(Refresh::Resync);
        }
        if reaction.run_terminal
            && let Some(run) = self.run.as_mut()
        {
            info!(event = "engine.run_terminal", run_id = %run.run_id, "run finished; stopping poller");
            run.poller = None;
            self.spawn_refresh(Refresh::Artifacts);
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> bool {
        let reaction = self.state.apply_transport(event, Utc::now());
        self.react(reaction);
        reaction.changed
    }

    fn on_fetch(&mut self, result: FetchResult) -> bool {
        match result {
            FetchResult::Snapshot(snapshot) => self.apply_snapshot_result(snapshot),
            FetchResult::Artifacts(artifacts) => self.apply_artifacts_result(artifacts),
            FetchResult::Resync {
                snapshot,
                artifacts,
            } => {
                let refreshed = snapshot.is_ok();
                let mut changed = self.apply_snapshot_result(snapshot);
                changed |= self.apply_artifacts_result(artifacts);
                if let Some(run) = self.run.as_mut() {
                    run.resync_pending = false;
                }
                if refreshed {
                    self.state.acknowledge_resync();
                    changed = true;
                }
                changed
            }
        }
    }

    fn apply_snapshot_result(
        &mut self,
        snapshot: Result<RunSnapshot, BackendError>,
    ) -> bool {
        match snapshot {
            Ok(snapshot) => {
                let reaction = self.state.apply_snapshot(snapshot);
                self.react(reaction);
                reaction.changed
            }
            Err(err) => {
                warn!(event = "engine.snapshot_failed", run_id = ?self.state.run_id(), error = %err, "snapshot fetch failed");
                false
            }
        }
    }

    fn apply_artifacts_result(
        &mut self,
        artifacts: Result<Vec<ArtifactDescriptor>, BackendError>,
    ) -> bool {
        match artifacts {
            Ok(artifacts) => self.state.apply_artifacts(artifacts).changed,
            Err(err) => {
                warn!(event = "engine.artifacts_failed", run_id = ?self.state.run_id(), error = %err, "artifact fetch failed");
                false
            }
        }
    }

    fn on_preview(&mut self, result: PreviewResult) -> bool {
        let mut preview = self.state.preview().clone();
        if !self.preview.apply(result, &mut preview) {
            return false;
        }
        self.state.set_preview(preview);
        true
    }

    fn liveness_changed(&self) -> bool {
        let live = self.state.connection().is_some_and(|connection| {
            connection.is_live(Utc::now(), self.state.config().heartbeat_stale_after())
        });
        live != self.view_tx.borrow().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileContent, FrameStream};
    use bytes::Bytes;
    use futures::channel::mpsc as frames;
    use plan_sync_core::preview::PreviewStatus;
    use plan_sync_core::{ConnectionStatus, InteractionStatus, RunStatus, TransportMode};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type FrameSender = frames::UnboundedSender<Result<String, BackendError>>;

    #[derive(Default)]
    struct FakeBackend {
        streams: Mutex<HashMap<String, frames::UnboundedReceiver<Result<String, BackendError>>>>,
        snapshots: Mutex<HashMap<String, RunSnapshot>>,
        artifacts: Mutex<Vec<ArtifactDescriptor>>,
        snapshot_fetches: AtomicUsize,
        artifact_fetches: AtomicUsize,
    }

    impl FakeBackend {
        fn stream_for(&self, run: &str) -> FrameSender {
            let (tx, rx) = frames::unbounded();
            self.streams.lock().expect("lock").insert(run.to_string(), rx);
            tx
        }

        fn set_snapshot(&self, run: &str, status: RunStatus, progress: u8) {
            let snapshot = RunSnapshot {
                status,
                progress_percentage: progress,
                ..RunSnapshot::empty(RunId::new(run))
            };
            self.snapshots.lock().expect("lock").insert(run.to_string(), snapshot);
        }
    }

    #[async_trait::async_trait]
    impl PlanBackend for FakeBackend {
        async fn fetch_snapshot(&self, run_id: &RunId) -> Result<RunSnapshot, BackendError> {
            self.snapshot_fetches.fetch_add(1, Ordering::SeqCst);
            self.snapshots
                .lock()
                .expect("lock")
                .get(run_id.as_str())
                .cloned()
                .ok_or_else(|| BackendError::Http {
                    status: 404,
                    message: "unknown plan".into(),
                })
        }

        async fn fetch_artifacts(&self, _run_id: &RunId) -> Result<Vec<ArtifactDescriptor>, BackendError> {
            self.artifact_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.artifacts.lock().expect("lock").clone())
        }

        async fn fetch_file(
            &self,
            _run_id: &RunId,
            filename: &str,
            _max_bytes: u64,
        ) -> Result<FileContent, BackendError> {
            let delay = if filename.starts_with("slow") {
                Duration::from_secs(5)
            } else {
                Duration::from_millis(10)
            };
            tokio::time::sleep(delay).await;
            Ok(FileContent {
                bytes: Bytes::from(format!("# {filename}")),
                content_type: "text/markdown".into(),
            })
        }

        async fn open_stream(&self, run_id: &RunId) -> Result<FrameStream, BackendError> {
            match self.streams.lock().expect("lock").remove(run_id.as_str()) {
                Some(rx) => Ok(Box::pin(rx)),
                None => Err(BackendError::Transport("connection refused".into())),
            }
        }
    }

    fn spawn_engine(backend: Arc<FakeBackend>) -> EngineHandle {
        PlanSyncEngine::builder(backend).spawn().expect("engine")
    }

    async fn wait_for(handle: &EngineHandle, pred: impl Fn(&EngineView) -> bool) -> EngineView {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                {
                    let view = rx.borrow_and_update();
                    if pred(&view) {
                        return view.clone();
                    }
                }
                rx.changed().await.expect("engine alive");
            }
        })
        .await
        .expect("view condition reached")
    }

    fn send(tx: &FrameSender, value: serde_json::Value) {
        tx.unbounded_send(Ok(value.to_string())).expect("stream open");
    }

    fn llm(id: i64, seq: u64, event: &str, data: serde_json::Value) -> serde_json::Value {
        json!({
            "type": "llm_stream", "plan_id": "plan-1", "stage": "risk_matrix",
            "interaction_id": id, "sequence": seq, "event": event, "data": data
        })
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_interaction_lands_in_history() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Running, 5);
        let tx = backend.stream_for("plan-1");
        let handle = spawn_engine(backend.clone());
        handle.watch_run("plan-1").await.expect("watch");
        wait_for(&handle, |v| v.connection.status == ConnectionStatus::Connected).await;

        send(&tx, json!({"type": "status", "status": "running", "progress_percentage": 12, "message": "Running tasks"}));
        send(&tx, llm(7, 0, "start", json!({"prompt_preview": "List risks"})));
        send(&tx, llm(7, 1, "text_delta", json!({"delta": "Identified "})));
        let view = wait_for(&handle, |v| v.active_interaction.is_some()).await;
        assert_eq!(view.active_interaction.as_ref().map(|s| s.interaction_id), Some(7));

        send(&tx, llm(7, 2, "text_delta", json!({"delta": "3 risks."})));
        send(&tx, llm(7, 3, "end", json!({"status": "completed"})));
        let view = wait_for(&handle, |v| !v.interaction_history.is_empty()).await;
        let done = &view.interaction_history[0];
        assert_eq!(done.status, InteractionStatus::Completed);
        assert_eq!(done.text, "Identified 3 risks.");
        assert!(view.active_interaction.is_none());
        assert!(view.run.as_ref().is_some_and(|r| r.progress_percentage >= 12));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_polling_when_push_is_unavailable() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Running, 30);
        let handle = spawn_engine(backend.clone());
        handle.watch_run("plan-1").await.expect("watch");

        let view = wait_for(&handle, |v| v.connection.mode == TransportMode::Pull).await;
        assert_eq!(view.connection.failed_attempts, 5);
        assert_eq!(view.run.as_ref().map(|r| r.progress_percentage), Some(30));

        backend.set_snapshot("plan-1", RunStatus::Completed, 100);
        let view = wait_for(&handle, |v| v.run.as_ref().is_some_and(|r| r.status == RunStatus::Completed)).await;
        assert_eq!(view.connection.mode, TransportMode::Pull);
        assert!(backend.snapshot_fetches.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_preview_of_earlier_selection_is_dropped() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Running, 0);
        let handle = spawn_engine(backend);
        handle.watch_run("plan-1").await.expect("watch");

        handle
            .select_preview(Some(ArtifactDescriptor::named("slow.md", "text/markdown")))
            .await
            .expect("select");
        handle
            .select_preview(Some(ArtifactDescriptor::named("fast.md", "text/markdown")))
            .await
            .expect("select");
        let view = wait_for(&handle, |v| matches!(v.preview.status, PreviewStatus::Ready(_))).await;
        let PreviewStatus::Ready(content) = &view.preview.status else {
            unreachable!("checked above");
        };
        assert_eq!(content.filename, "fast.md");

        tokio::time::sleep(Duration::from_secs(10)).await;
        let PreviewStatus::Ready(content) = handle.view().preview.status else {
            panic!("preview should stay ready");
        };
        assert_eq!(content.filename, "fast.md");
    }

    #[tokio::test(start_paused = true)]
    async fn switching_runs_discards_previous_state() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Running, 40);
        backend.set_snapshot("plan-2", RunStatus::Pending, 0);
        let old = backend.stream_for("plan-1");
        let handle = spawn_engine(backend.clone());
        handle.watch_run("plan-1").await.expect("watch");
        send(&old, llm(7, 0, "start", json!({})));
        wait_for(&handle, |v| v.active_interaction.is_some()).await;

        handle.watch_run("plan-2").await.expect("watch");
        let _ = old.unbounded_send(Ok(llm(8, 0, "start", json!({})).to_string()));
        let view = wait_for(&handle, |v| v.run.as_ref().is_some_and(|r| r.id == RunId::new("plan-2"))).await;
        assert_eq!(view.run_id, Some(RunId::new("plan-2")));
        assert!(view.active_interaction.is_none());
        assert!(view.interaction_history.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let view = handle.view();
        assert_eq!(view.run.as_ref().map(|r| r.progress_percentage), Some(0));
        assert!(view.active_interaction.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_run_stops_polling_after_final_artifact_fetch() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Completed, 100);
        *backend.artifacts.lock().expect("lock") = vec![ArtifactDescriptor::named("report.html", "text/html")];
        let handle = spawn_engine(backend.clone());
        handle.watch_run("plan-1").await.expect("watch");

        let view = wait_for(&handle, |v| {
            v.run.as_ref().is_some_and(|r| r.status == RunStatus::Completed) && !v.artifacts.is_empty()
        })
        .await;
        assert_eq!(view.artifacts[0].filename, "report.html");

        let snapshots = backend.snapshot_fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.snapshot_fetches.load(Ordering::SeqCst), snapshots);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_gap_triggers_resync() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Running, 10);
        let tx = backend.stream_for("plan-1");
        let handle = spawn_engine(backend.clone());
        handle.watch_run("plan-1").await.expect("watch");
        wait_for(&handle, |v| v.connection.status == ConnectionStatus::Connected).await;

        send(&tx, llm(7, 0, "start", json!({})));
        send(&tx, llm(7, 2, "text_delta", json!({"delta": "late"})));
        let view = wait_for(&handle, |v| {
            v.connection.gap_count > 0 && !v.connection.resync_hint
        })
        .await;
        assert!(view.active_interaction.is_some_and(|s| s.gap_detected));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_snapshot_lands_before_next_poll() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Running, 20);
        let _tx = backend.stream_for("plan-1");
        let handle = spawn_engine(backend.clone());
        handle.watch_run("plan-1").await.expect("watch");
        wait_for(&handle, |v| v.run.as_ref().is_some_and(|r| r.progress_percentage == 20)).await;
        let polled = backend.snapshot_fetches.load(Ordering::SeqCst);

        backend.set_snapshot("plan-1", RunStatus::Running, 55);
        handle.refresh_snapshot().await.expect("refresh");
        // The next scheduled poll is 3 s away.
        let view = tokio::time::timeout(
            Duration::from_millis(500),
            wait_for(&handle, |v| v.run.as_ref().is_some_and(|r| r.progress_percentage == 55)),
        )
        .await
        .expect("refresh landed before the poll tick");
        assert_eq!(view.run_id, Some(RunId::new("plan-1")));
        assert_eq!(backend.snapshot_fetches.load(Ordering::SeqCst), polled + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_artifacts_updates_view() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Running, 20);
        let _tx = backend.stream_for("plan-1");
        let handle = spawn_engine(backend.clone());
        handle.watch_run("plan-1").await.expect("watch");
        wait_for(&handle, |v| v.run.is_some()).await;
        assert!(handle.view().artifacts.is_empty());

        *backend.artifacts.lock().expect("lock") = vec![
            ArtifactDescriptor::named("002-project_plan.md", "text/markdown"),
            ArtifactDescriptor::named("001-start_time.json", "application/json"),
        ];
        handle.refresh_artifacts().await.expect("refresh");
        let view = tokio::time::timeout(
            Duration::from_millis(500),
            wait_for(&handle, |v| v.artifacts.len() == 2),
        )
        .await
        .expect("artifacts refreshed before the poll tick");
        let names: Vec<&str> = view.artifacts.iter().map(|a| a.filename.as_str()).collect();
        assert!(names.contains(&"001-start_time.json"));
        assert!(names.contains(&"002-project_plan.md"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_run_stops_polling_and_ignores_late_frames() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_snapshot("plan-1", RunStatus::Running, 20);
        let tx = backend.stream_for("plan-1");
        let handle = spawn_engine(backend.clone());
        handle.watch_run("plan-1").await.expect("watch");
        wait_for(&handle, |v| v.connection.status == ConnectionStatus::Connected).await;
        send(&tx, llm(7, 0, "start", json!({})));
        wait_for(&handle, |v| v.active_interaction.is_some()).await;

        handle.clear_run().await.expect("clear");
        let view = wait_for(&handle, |v| v.run_id.is_none()).await;
        assert!(view.run.is_none());
        assert!(view.active_interaction.is_none());
        assert_eq!(view.connection.status, ConnectionStatus::Idle);

        let snapshots = backend.snapshot_fetches.load(Ordering::SeqCst);
        let _ = tx.unbounded_send(Ok(llm(8, 0, "start", json!({})).to_string()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.snapshot_fetches.load(Ordering::SeqCst), snapshots);
        let view = handle.view();
        assert!(view.run_id.is_none());
        assert!(view.active_interaction.is_none());
        assert!(view.interaction_history.is_empty());

        // Refreshes without a watched run are no-ops.
        handle.refresh_snapshot().await.expect("refresh");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.snapshot_fetches.load(Ordering::SeqCst), snapshots);
    }

    #[tokio::test]
    async fn rejects_empty_run_id_and_commands_after_shutdown() {
        let handle = spawn_engine(Arc::new(FakeBackend::default()));
        assert!(matches!(
            handle.watch_run("  ").await,
            Err(EngineError::Validation(_))
        ));
        handle.shutdown().await.expect("shutdown");
        assert_eq!(handle.watch_run("plan-1").await, Err(EngineError::Closed));
        assert_eq!(handle.refresh_snapshot().await, Err(EngineError::Closed));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_spawn() {
        let result = PlanSyncEngine::builder(Arc::new(FakeBackend::default()))
            .config(SyncConfig::default().snapshot_poll_interval_ms(0))
            .spawn();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
