use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of one pipeline run (for example a plan id).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Creates a run id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the run id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Parses a lifecycle status. Returns `None` for markers that are not
    /// lifecycle states (`stdout_closed`, `fallback`, ...).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration the run was created with, echoed back by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfigEcho {
    /// Model identifier used for the run.
    pub model: Option<String>,
    /// Effort level (speed vs. detail).
    pub effort: Option<String>,
    /// Original prompt, when the backend returns it.
    pub prompt: Option<String>,
}

/// Run-level fields owned by the plan state store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub status: RunStatus,
    /// Progress percentage in `[0, 100]`.
    pub progress_percentage: u8,
    pub progress_message: String,
    pub error_message: Option<String>,
    /// Missing when the store has only seen push updates so far.
    pub created_at: Option<DateTime<Utc>>,
    pub config: RunConfigEcho,
    /// Set by a push stall warning; cleared by the next progress increase or snapshot.
    #[serde(default)]
    pub stalled: bool,
}

impl RunSnapshot {
    /// Empty snapshot for a run that has not reported anything yet.
    pub fn empty(id: RunId) -> Self {
        Self {
            id,
            status: RunStatus::Pending,
            progress_percentage: 0,
            progress_message: String::new(),
            error_message: None,
            created_at: None,
            config: RunConfigEcho::default(),
            stalled: false,
        }
    }
}

/// Clamps a raw percentage into `[0, 100]`.
pub fn clamp_percentage(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

/// One artifact produced by the pipeline, as listed by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub filename: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub task_name: Option<String>,
    /// Explicit display order; artifacts without one sort last.
    #[serde(default)]
    pub order: Option<i64>,
}

impl ArtifactDescriptor {
    /// Minimal descriptor, mostly useful for callers selecting by filename.
    pub fn named(filename: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            stage: None,
            content_type: content_type.into(),
            size_bytes: 0,
            created_at: None,
            description: None,
            task_name: None,
            order: None,
        }
    }

    /// Whether two descriptors refer to the same artifact.
    pub fn same_artifact(&self, other: &ArtifactDescriptor) -> bool {
        self.filename == other.filename
    }
}

fn compare_artifacts(a: &ArtifactDescriptor, b: &ArtifactDescriptor) -> Ordering {
    let by_order = match (a.order, b.order) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_order.then_with(|| a.filename.cmp(&b.filename))
}

/// Stable sort by explicit order, filename as tiebreaker.
pub fn sort_artifacts(artifacts: &mut [ArtifactDescriptor]) {
    artifacts.sort_by(compare_artifacts);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(filename: &str, order: Option<i64>) -> ArtifactDescriptor {
        ArtifactDescriptor {
            order,
            ..ArtifactDescriptor::named(filename, "md")
        }
    }

    #[test]
    fn status_parse_ignores_non_lifecycle_markers() {
        assert_eq!(RunStatus::parse("Running"), Some(RunStatus::Running));
        assert_eq!(RunStatus::parse("canceled"), Some(RunStatus::Cancelled));
        assert_eq!(RunStatus::parse("stdout_closed"), None);
        assert_eq!(RunStatus::parse("fallback"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn artifacts_sort_by_order_then_filename() {
        let mut list = vec![
            artifact("zeta.md", None),
            artifact("b.md", Some(2)),
            artifact("alpha.md", None),
            artifact("a.md", Some(2)),
            artifact("first.md", Some(1)),
        ];
        sort_artifacts(&mut list);
        let names: Vec<&str> = list.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["first.md", "a.md", "b.md", "alpha.md", "zeta.md"]);
    }

    #[test]
    fn clamp_percentage_bounds() {
        assert_eq!(clamp_percentage(-3.0), 0);
        assert_eq!(clamp_percentage(42.4), 42);
        assert_eq!(clamp_percentage(250.0), 100);
        assert_eq!(clamp_percentage(f64::NAN), 0);
    }
}
