/// Reason a raw push frame could not be classified into a typed event.
///
/// Never fatal: the transport turns it into an unclassified
/// [`PushEvent::Raw`](crate::event::PushEvent::Raw) and keeps reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Frame body is not valid JSON.
    #[error("invalid frame JSON: {0}")]
    InvalidJson(String),
    /// Frame is JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// A required field is absent.
    #[error("frame field missing: {0}")]
    MissingField(&'static str),
    /// A field is present with the wrong type or an unusable value.
    #[error("frame field {field} invalid: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

impl FrameError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }
}

/// Invalid [`SyncConfig`](crate::config::SyncConfig) value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}
