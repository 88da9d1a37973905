use plan_sync_core::ConfigError;
use plan_sync_core::preview::{PreviewFailure, PreviewFailureKind, PreviewRejection};

/// Errors returned by a [`PlanBackend`](crate::backend::PlanBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Backend answered with a non-success HTTP status.
    #[error("backend returned {status}: {message}")]
    Http { status: u16, message: String },
    /// Connection or stream I/O failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Response body did not have the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
    /// Body read was cut off at the size limit.
    #[error("body exceeds {limit} bytes (read {received})")]
    BodyTooLarge { limit: u64, received: u64 },
    /// A request URL could not be built.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl BackendError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Failure of one preview request. Cleared by the next selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreviewError {
    #[error("preview too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("content type {content_type:?} cannot be previewed")]
    UnsupportedContent { content_type: String },
    #[error(transparent)]
    Backend(BackendError),
}

impl From<PreviewRejection> for PreviewError {
    fn from(value: PreviewRejection) -> Self {
        match value {
            PreviewRejection::TooLarge { size, limit } => Self::TooLarge { size, limit },
            PreviewRejection::UnsupportedContent { content_type } => {
                Self::UnsupportedContent { content_type }
            }
        }
    }
}

impl From<BackendError> for PreviewError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::BodyTooLarge { limit, received } => Self::TooLarge {
                size: received,
                limit,
            },
            other => Self::Backend(other),
        }
    }
}

impl PreviewError {
    /// Display form stored in the view.
    pub fn to_failure(&self) -> PreviewFailure {
        let kind = match self {
            Self::TooLarge { .. } => PreviewFailureKind::TooLarge,
            Self::UnsupportedContent { .. } => PreviewFailureKind::UnsupportedContent,
            Self::Backend(_) => PreviewFailureKind::Network,
        };
        PreviewFailure {
            kind,
            message: self.to_string(),
        }
    }
}

/// Errors returned by [`EngineHandle`](crate::engine::EngineHandle) methods.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    /// The engine task has stopped.
    #[error("engine closed")]
    Closed,
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
