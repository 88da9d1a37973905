//! Typed push events and the frame classifier that produces them.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::errors::FrameError;
use crate::model::{RunId, RunStatus, clamp_percentage};

/// Closed set of events the push channel can deliver.
#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    /// Run-level status/progress update.
    Status(StatusUpdate),
    /// Keep-alive from the backend.
    Heartbeat { timestamp: Option<DateTime<Utc>> },
    /// Fine-grained event for one interaction.
    Subtask(SubtaskEvent),
    /// The run has finished streaming; the backend will close the channel.
    StreamEnd { message: Option<String> },
    /// Backend-reported error on the channel.
    Error { message: String },
    /// Ordinary text/log line from the pipeline.
    Log {
        message: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Anything that could not be classified, passed through verbatim.
    Raw { text: String },
}

impl PushEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Subtask(_) => "subtask",
            Self::StreamEnd { .. } => "stream_end",
            Self::Error { .. } => "error",
            Self::Log { .. } => "log",
            Self::Raw { .. } => "raw",
        }
    }
}

/// Partial run-level update carried by a `status` frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusUpdate {
    /// Lifecycle status, when the frame carries one.
    pub status: Option<RunStatus>,
    /// Raw status string when it is not a lifecycle state (`stdout_closed`, `fallback`).
    pub marker: Option<String>,
    pub message: Option<String>,
    pub progress_percentage: Option<u8>,
    pub stall_warning: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Error text implied by the update: the message of a `failed` status.
    pub fn error_message(&self) -> Option<&str> {
        match self.status {
            Some(RunStatus::Failed) => self.message.as_deref(),
            _ => None,
        }
    }
}

/// One event for one interaction, keyed by `interaction_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtaskEvent {
    pub run_id: Option<RunId>,
    pub stage: Option<String>,
    pub interaction_id: i64,
    /// Per-interaction sequence number, starting at 0.
    pub sequence: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: SubtaskKind,
    /// Raw `data` object as received, before interpretation.
    pub payload: Value,
}

/// Payload of a `final` event. Present values are authoritative.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FinalPayload {
    pub text: Option<String>,
    pub reasoning: Option<String>,
    pub usage: Option<Value>,
    pub raw_payload: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubtaskKind {
    Start { prompt_preview: Option<String> },
    TextDelta { delta: String },
    ReasoningDelta { delta: String },
    Final(FinalPayload),
    End { failed: bool, error: Option<String> },
    /// Unrecognised event name; ignored by the multiplexer.
    Unknown(String),
}

impl SubtaskKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Start { .. } => "start",
            Self::TextDelta { .. } => "text_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::Final(_) => "final",
            Self::End { .. } => "end",
            Self::Unknown(name) => name.as_str(),
        }
    }
}

/// Parses a timestamp that may be RFC 3339 or a naive ISO-8601 string in UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Classifies one frame, falling back to [`PushEvent::Raw`] on any decode failure.
pub fn classify_frame(text: &str) -> PushEvent {
    match decode_frame(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(event = "frame.unclassified", error = %err, "passing frame through as raw");
            PushEvent::Raw {
                text: text.to_string(),
            }
        }
    }
}

/// Decodes one frame body into a typed event.
pub fn decode_frame(text: &str) -> Result<PushEvent, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let obj = value.as_object().ok_or(FrameError::NotAnObject)?;
    let frame_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingField("type"))?;
    let timestamp = opt_str(&value, "timestamp").and_then(parse_timestamp);

    match frame_type {
        "status" => decode_status(&value, timestamp).map(PushEvent::Status),
        "heartbeat" => Ok(PushEvent::Heartbeat { timestamp }),
        "llm_stream" | "subtask" => decode_subtask(&value, timestamp).map(PushEvent::Subtask),
        "stream_end" => Ok(PushEvent::StreamEnd {
            message: opt_string(&value, "message"),
        }),
        "error" => Ok(PushEvent::Error {
            message: opt_string(&value, "message")
                .or_else(|| opt_string(&value, "error"))
                .unwrap_or_else(|| "unspecified stream error".to_string()),
        }),
        "log" => Ok(PushEvent::Log {
            message: opt_string(&value, "message").ok_or(FrameError::MissingField("message"))?,
            timestamp,
        }),
        _ => Ok(PushEvent::Raw {
            text: text.to_string(),
        }),
    }
}

fn decode_status(value: &Value, timestamp: Option<DateTime<Utc>>) -> Result<StatusUpdate, FrameError> {
    let raw_status = opt_str(value, "status");
    let status = raw_status.and_then(RunStatus::parse);
    let marker = match (raw_status, status) {
        (Some(raw), None) => Some(raw.to_string()),
        _ => None,
    };
    let progress_percentage = match value.get("progress_percentage") {
        None | Some(Value::Null) => None,
        Some(v) => Some(clamp_percentage(v.as_f64().ok_or_else(|| {
            FrameError::invalid("progress_percentage", "expected a number")
        })?)),
    };
    Ok(StatusUpdate {
        status,
        marker,
        message: opt_string(value, "message"),
        progress_percentage,
        stall_warning: value
            .get("stall_warning")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        timestamp,
    })
}

fn decode_subtask(
    value: &Value,
    timestamp: Option<DateTime<Utc>>,
) -> Result<SubtaskEvent, FrameError> {
    let interaction_id = match value.get("interaction_id") {
        None | Some(Value::Null) => return Err(FrameError::MissingField("interaction_id")),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| FrameError::invalid("interaction_id", "expected an integer"))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| FrameError::invalid("interaction_id", e.to_string()))?,
        Some(_) => return Err(FrameError::invalid("interaction_id", "expected an integer")),
    };
    let sequence = match value.get("sequence") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| FrameError::invalid("sequence", "expected a non-negative integer"))?,
        ),
    };
    let event_name = opt_str(value, "event")
        .or_else(|| opt_str(value, "kind"))
        .ok_or(FrameError::MissingField("event"))?;
    let payload = value.get("data").cloned().unwrap_or(Value::Null);
    let kind = decode_subtask_kind(event_name, &payload)?;

    Ok(SubtaskEvent {
        run_id: opt_string(value, "plan_id").map(RunId::new),
        stage: opt_string(value, "stage"),
        interaction_id,
        sequence,
        timestamp,
        kind,
        payload,
    })
}

fn decode_subtask_kind(name: &str, data: &Value) -> Result<SubtaskKind, FrameError> {
    Ok(match name {
        "start" => SubtaskKind::Start {
            prompt_preview: opt_string(data, "prompt_preview"),
        },
        "text_delta" => SubtaskKind::TextDelta {
            delta: required_delta(data)?,
        },
        "reasoning_delta" => SubtaskKind::ReasoningDelta {
            delta: required_delta(data)?,
        },
        "final" => SubtaskKind::Final(FinalPayload {
            text: opt_string(data, "text"),
            reasoning: opt_string(data, "reasoning"),
            usage: non_null(data, "usage"),
            raw_payload: non_null(data, "raw_payload"),
        }),
        "end" => {
            let status = opt_str(data, "status").map(|s| s.trim().to_ascii_lowercase());
            let error = opt_string(data, "error");
            let failed = match status.as_deref() {
                Some("failed" | "error" | "cancelled") => true,
                Some("completed" | "success" | "ok") => false,
                _ => error.is_some(),
            };
            SubtaskKind::End { failed, error }
        }
        other => SubtaskKind::Unknown(other.to_string()),
    })
}

fn required_delta(data: &Value) -> Result<String, FrameError> {
    match data.get("delta") {
        Some(Value::String(s)) => Ok(s.clone()),
        None | Some(Value::Null) => Err(FrameError::MissingField("data.delta")),
        Some(_) => Err(FrameError::invalid("data.delta", "expected a string")),
    }
}

fn opt_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn opt_string(value: &Value, key: &str) -> Option<String> {
    opt_str(value, key).map(ToOwned::to_owned)
}

fn non_null(value: &Value, key: &str) -> Option<Value> {
    value.get(key).filter(|v| !v.is_null()).cloned()
}
