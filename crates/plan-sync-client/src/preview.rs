//! On-demand artifact preview with a stale-response guard.

use std::sync::Arc;

use plan_sync_core::preview::{PreviewContent, PreviewState, PreviewStatus, decode_preview, precheck};
use plan_sync_core::{ArtifactDescriptor, RunId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::PlanBackend;
use crate::errors::PreviewError;
use crate::poller::TaskGuard;

/// Completed fetch, tagged with the selection it belongs to.
#[derive(Debug)]
pub struct PreviewResult {
    pub generation: u64,
    pub filename: String,
    pub result: Result<PreviewContent, PreviewError>,
}

/// Fetches, size-checks and classifies one artifact.
pub async fn fetch_preview(
    backend: &dyn PlanBackend,
    run_id: &RunId,
    artifact: &ArtifactDescriptor,
    max_bytes: u64,
) -> Result<PreviewContent, PreviewError> {
    precheck(artifact, max_bytes)?;
    let file = backend.fetch_file(run_id, &artifact.filename, max_bytes).await?;
    let content_type = if file.content_type.trim().is_empty() {
        artifact.content_type.as_str()
    } else {
        file.content_type.as_str()
    };
    Ok(decode_preview(&artifact.filename, content_type, &file.bytes, max_bytes)?)
}

/// Tracks the current selection; only the latest fetch may land.
pub struct PreviewService {
    backend: Arc<dyn PlanBackend>,
    max_bytes: u64,
    generation: u64,
    inflight: Option<TaskGuard>,
}

impl PreviewService {
    pub fn new(backend: Arc<dyn PlanBackend>, max_bytes: u64) -> Self {
        Self {
            backend,
            max_bytes,
            generation: 0,
            inflight: None,
        }
    }

    /// Selects `artifact` (or clears the selection) and returns the new slot state.
    ///
    /// Any fetch still running for an earlier selection is cancelled, and its
    /// result is ignored if it was already queued.
    pub fn select(
        &mut self,
        run_id: Option<&RunId>,
        artifact: Option<ArtifactDescriptor>,
        results: &mpsc::Sender<PreviewResult>,
    ) -> PreviewState {
        self.generation += 1;
        self.inflight = None;
        let (Some(run_id), Some(artifact)) = (run_id, artifact) else {
            return PreviewState::default();
        };

        if let Err(rejection) = precheck(&artifact, self.max_bytes) {
            let err = PreviewError::from(rejection);
            debug!(event = "preview.rejected", filename = %artifact.filename, error = %err, "preview rejected before fetch");
            return PreviewState {
                selected: Some(artifact),
                status: PreviewStatus::Failed(err.to_failure()),
            };
        }

        let generation = self.generation;
        let backend = self.backend.clone();
        let run_id = run_id.clone();
        let target = artifact.clone();
        let max_bytes = self.max_bytes;
        let results = results.clone();
        self.inflight = Some(TaskGuard::spawn(async move {
            let result = fetch_preview(backend.as_ref(), &run_id, &target, max_bytes).await;
            let _ = results
                .send(PreviewResult {
                    generation,
                    filename: target.filename,
                    result,
                })
                .await;
        }));
        PreviewState {
            selected: Some(artifact),
            status: PreviewStatus::Loading,
        }
    }

    /// Whether `result` answers the current selection.
    pub fn is_current(&self, result: &PreviewResult, state: &PreviewState) -> bool {
        result.generation == self.generation
            && state
                .selected
                .as_ref()
                .is_some_and(|selected| selected.filename == result.filename)
    }

    /// Applies a result to `state` if it is current. Returns whether it landed.
    pub fn apply(&mut self, result: PreviewResult, state: &mut PreviewState) -> bool {
        if !self.is_current(&result, state) {
            debug!(event = "preview.stale", filename = %result.filename, generation = result.generation, current = self.generation, "dropping stale preview result");
            return false;
        }
        self.inflight = None;
        state.status = match result.result {
            Ok(content) => PreviewStatus::Ready(content),
            Err(err) => {
                debug!(event = "preview.failed", filename = %result.filename, error = %err, "preview failed");
                PreviewStatus::Failed(err.to_failure())
            }
        };
        true
    }

    /// Forgets the selection and cancels any fetch.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.inflight = None;
    }
}
