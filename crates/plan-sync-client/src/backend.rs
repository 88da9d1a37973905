use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use plan_sync_core::{ArtifactDescriptor, RunId, RunSnapshot};

use crate::errors::BackendError;

/// Push channel body: one item per frame payload.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send + 'static>>;

/// Raw file content returned for previews.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContent {
    pub bytes: Bytes,
    /// `Content-Type` reported by the backend; may be empty.
    pub content_type: String,
}

/// Everything the engine needs from the backend.
#[async_trait::async_trait]
pub trait PlanBackend: Send + Sync + 'static {
    /// Fetches the durable run snapshot.
    async fn fetch_snapshot(&self, run_id: &RunId) -> Result<RunSnapshot, BackendError>;

    /// Fetches the artifact list in backend order.
    async fn fetch_artifacts(&self, run_id: &RunId) -> Result<Vec<ArtifactDescriptor>, BackendError>;

    /// Fetches one file, failing with [`BackendError::BodyTooLarge`] past `max_bytes`.
    async fn fetch_file(
        &self,
        run_id: &RunId,
        filename: &str,
        max_bytes: u64,
    ) -> Result<FileContent, BackendError>;

    /// Opens the push channel for a run.
    async fn open_stream(&self, run_id: &RunId) -> Result<FrameStream, BackendError>;
}
