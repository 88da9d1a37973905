//! Preview classification and the preview slot shown in the view.
//!
//! Fetching lives in the client crate; this module decides what a payload
//! is, whether it may be previewed, and how it is presented.

use serde::Serialize;

use crate::model::ArtifactDescriptor;

/// How a preview body should be presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentClass {
    Json,
    /// Must be rendered sandboxed by the consumer.
    Html,
    Markdown,
    Csv,
    Text,
    /// Not previewable; download only.
    Binary,
}

impl ContentClass {
    pub fn is_previewable(self) -> bool {
        !matches!(self, Self::Binary)
    }
}

fn class_from_mime(content_type: &str) -> Option<ContentClass> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let class = match mime.as_str() {
        "" | "application/octet-stream" => return None,
        "application/json" | "text/json" => ContentClass::Json,
        m if m.ends_with("+json") => ContentClass::Json,
        "text/html" | "application/xhtml+xml" => ContentClass::Html,
        "text/markdown" | "text/x-markdown" => ContentClass::Markdown,
        "text/csv" => ContentClass::Csv,
        // Short forms used in artifact listings.
        "json" => ContentClass::Json,
        "html" => ContentClass::Html,
        "md" | "markdown" => ContentClass::Markdown,
        "csv" => ContentClass::Csv,
        "txt" | "text" => ContentClass::Text,
        m if m.starts_with("text/") => ContentClass::Text,
        "application/xml" | "application/yaml" | "application/x-yaml" | "application/javascript" => {
            ContentClass::Text
        }
        _ => ContentClass::Binary,
    };
    Some(class)
}

fn class_from_extension(filename: &str) -> Option<ContentClass> {
    let (_, ext) = filename.rsplit_once('.')?;
    let class = match ext.to_ascii_lowercase().as_str() {
        "json" => ContentClass::Json,
        "html" | "htm" => ContentClass::Html,
        "md" | "markdown" => ContentClass::Markdown,
        "csv" => ContentClass::Csv,
        "txt" | "log" | "yaml" | "yml" | "xml" | "toml" => ContentClass::Text,
        "pdf" | "png" | "jpg" | "jpeg" | "gif" | "zip" | "xlsx" | "docx" | "pptx" => {
            ContentClass::Binary
        }
        _ => return None,
    };
    Some(class)
}

fn class_from_bytes(bytes: &[u8]) -> ContentClass {
    let head = &bytes[..bytes.len().min(1024)];
    if head.contains(&0) || std::str::from_utf8(bytes).is_err() {
        ContentClass::Binary
    } else {
        ContentClass::Text
    }
}

/// Classifies by content type, then by filename extension.
///
/// `None` means neither is conclusive and the body has to be sniffed.
pub fn classify_content(content_type: &str, filename: &str) -> Option<ContentClass> {
    class_from_mime(content_type).or_else(|| class_from_extension(filename))
}

/// Why a payload cannot be previewed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PreviewRejection {
    #[error("preview too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("content type {content_type:?} cannot be previewed")]
    UnsupportedContent { content_type: String },
}

/// Checks a descriptor before any bytes are fetched.
pub fn precheck(artifact: &ArtifactDescriptor, limit: u64) -> Result<(), PreviewRejection> {
    if artifact.size_bytes > limit {
        return Err(PreviewRejection::TooLarge {
            size: artifact.size_bytes,
            limit,
        });
    }
    match classify_content(&artifact.content_type, &artifact.filename) {
        Some(ContentClass::Binary) => Err(PreviewRejection::UnsupportedContent {
            content_type: artifact.content_type.clone(),
        }),
        _ => Ok(()),
    }
}

/// Decoded, display-ready preview body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PreviewContent {
    pub filename: String,
    pub content_type: String,
    pub class: ContentClass,
    pub body: String,
    /// JSON that parsed and was re-indented.
    pub pretty_printed: bool,
    /// Consumer must render in an isolated, script-free frame.
    pub sandboxed: bool,
    pub size_bytes: u64,
}

/// Turns fetched bytes into a preview, or rejects them.
pub fn decode_preview(
    filename: &str,
    content_type: &str,
    bytes: &[u8],
    limit: u64,
) -> Result<PreviewContent, PreviewRejection> {
    let size = bytes.len() as u64;
    if size > limit {
        return Err(PreviewRejection::TooLarge { size, limit });
    }
    let class = classify_content(content_type, filename).unwrap_or_else(|| class_from_bytes(bytes));
    if !class.is_previewable() {
        return Err(PreviewRejection::UnsupportedContent {
            content_type: content_type.to_string(),
        });
    }
    let text = String::from_utf8_lossy(bytes).into_owned();
    let (body, pretty_printed) = if class == ContentClass::Json {
        match serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|value| serde_json::to_string_pretty(&value).ok())
        {
            Some(pretty) => (pretty, true),
            None => {
                tracing::debug!(event = "preview.json_fallback", filename, "showing unparsable JSON as raw text");
                (text, false)
            }
        }
    } else {
        (text, false)
    };
    Ok(PreviewContent {
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        class,
        body,
        pretty_printed,
        sandboxed: class == ContentClass::Html,
        size_bytes: size,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewFailureKind {
    TooLarge,
    UnsupportedContent,
    Network,
}

/// Error shown for one preview request; replaced by the next selection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PreviewFailure {
    pub kind: PreviewFailureKind,
    pub message: String,
}

impl From<&PreviewRejection> for PreviewFailure {
    fn from(rejection: &PreviewRejection) -> Self {
        let kind = match rejection {
            PreviewRejection::TooLarge { .. } => PreviewFailureKind::TooLarge,
            PreviewRejection::UnsupportedContent { .. } => PreviewFailureKind::UnsupportedContent,
        };
        Self {
            kind,
            message: rejection.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum PreviewStatus {
    #[default]
    Idle,
    Loading,
    Ready(PreviewContent),
    Failed(PreviewFailure),
}

/// Selected artifact and the state of its preview.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PreviewState {
    pub selected: Option<ArtifactDescriptor>,
    pub status: PreviewStatus,
}
