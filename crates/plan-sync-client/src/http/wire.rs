//! JSON bodies of the planning API and their mapping onto core records.

use plan_sync_core::event::parse_timestamp;
use plan_sync_core::model::{ArtifactDescriptor, RunConfigEcho, RunId, RunSnapshot, RunStatus, clamp_percentage};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub(crate) struct PlanResponse {
    pub plan_id: String,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub speed_vs_detail: Option<String>,
    #[serde(default)]
    pub progress_percentage: Option<f64>,
    #[serde(default)]
    pub progress_message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl PlanResponse {
    pub fn into_snapshot(self) -> RunSnapshot {
        let status = RunStatus::parse(&self.status).unwrap_or_else(|| {
            warn!(event = "wire.unknown_status", plan_id = %self.plan_id, status = %self.status, "treating unknown status as pending");
            RunStatus::Pending
        });
        RunSnapshot {
            id: RunId::new(self.plan_id),
            status,
            progress_percentage: self.progress_percentage.map(clamp_percentage).unwrap_or(0),
            progress_message: self.progress_message.unwrap_or_default(),
            error_message: self.error_message.filter(|m| !m.trim().is_empty()),
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            config: RunConfigEcho {
                model: self.llm_model,
                effort: self.speed_vs_detail,
                prompt: self.prompt,
            },
            stalled: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ArtefactListResponse {
    #[serde(default)]
    pub artefacts: Vec<Artefact>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Artefact {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub order: Option<i64>,
}

impl From<Artefact> for ArtifactDescriptor {
    fn from(value: Artefact) -> Self {
        ArtifactDescriptor {
            filename: value.filename,
            stage: value.stage,
            content_type: value.content_type.unwrap_or_default(),
            size_bytes: value.size_bytes.unwrap_or(0),
            created_at: value.created_at.as_deref().and_then(parse_timestamp),
            description: value.description,
            task_name: value.task_name,
            order: value.order,
        }
    }
}
