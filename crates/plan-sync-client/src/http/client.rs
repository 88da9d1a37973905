use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::stream;
use futures::{Stream, StreamExt as _};
use plan_sync_core::{ArtifactDescriptor, RunId, RunSnapshot};
use reqwest::{Response, Url, header};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use super::config::HttpBackendConfig;
use super::wire::{ArtefactListResponse, PlanResponse};
use crate::backend::{FileContent, FrameStream, PlanBackend};
use crate::errors::BackendError;

type ByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static>>;

const ERROR_BODY_LIMIT: usize = 512;

/// [`PlanBackend`] over the planning REST API and its WebSocket push channel.
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    timeout: std::time::Duration,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let base = Url::parse(config.base_url.trim())
            .map_err(|e| BackendError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(format!(
                "{} cannot be used as a base url",
                config.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base,
            timeout: config.timeout,
        })
    }

    pub fn from_env() -> Result<Self, BackendError> {
        Self::new(HttpBackendConfig::from_env())
    }

    /// REST url under `{base}/api/plans/`.
    pub(crate) fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        join(self.base.clone(), &["api", "plans"], segments)
    }

    /// Push channel url, `ws(s)://{host}/ws/plans/{id}/progress`.
    pub(crate) fn push_url(&self, run_id: &RunId) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| BackendError::InvalidUrl(format!("{} has no websocket form", self.base)))?;
        join(url, &["ws", "plans"], &[run_id.as_str(), "progress"])
    }

    async fn get(&self, url: Url) -> Result<Response, BackendError> {
        debug!(event = "http.get", url = %url, "backend request");
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(BackendError::transport)?;
        ensure_success(response).await
    }
}

fn join(mut url: Url, prefix: &[&str], segments: &[&str]) -> Result<Url, BackendError> {
    let invalid = url.to_string();
    url.path_segments_mut()
        .map_err(|_| BackendError::InvalidUrl(invalid))?
        .pop_if_empty()
        .extend(prefix)
        .extend(segments);
    Ok(url)
}

async fn ensure_success(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut message = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    if message.len() > ERROR_BODY_LIMIT {
        let cut = (0..=ERROR_BODY_LIMIT)
            .rev()
            .find(|i| message.is_char_boundary(*i))
            .unwrap_or(0);
        message.truncate(cut);
    }
    Err(BackendError::Http {
        status: status.as_u16(),
        message,
    })
}

fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Reads a body, aborting once it grows past `max_bytes`.
async fn read_capped(mut body: ByteStream, max_bytes: u64) -> Result<Bytes, BackendError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(BackendError::transport)?;
        buf.extend_from_slice(&chunk);
        let received = buf.len() as u64;
        if received > max_bytes {
            return Err(BackendError::BodyTooLarge {
                limit: max_bytes,
                received,
            });
        }
    }
    Ok(buf.freeze())
}

/// Turns push-channel messages into frame payloads, one per text message.
///
/// A close frame ends the stream; pings, pongs and blank messages are skipped.
fn frame_stream<S>(messages: S) -> FrameStream
where
    S: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
{
    let frames = stream::unfold(Some(messages), |state| async move {
        let mut messages = state?;
        loop {
            let text = match messages.next().await? {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!(event = "ws.binary_skipped", "skipping non-utf8 binary message");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    debug!(event = "ws.close_frame", frame = ?frame, "backend closed push channel");
                    return None;
                }
                Ok(_) => continue,
                Err(err) => {
                    return Some((
                        Err(BackendError::transport(format!("push channel read failed: {err}"))),
                        None,
                    ));
                }
            };
            if !text.trim().is_empty() {
                return Some((Ok(text), Some(messages)));
            }
        }
    });
    Box::pin(frames)
}

fn connect_error(err: WsError) -> BackendError {
    match err {
        WsError::Http(response) => BackendError::Http {
            status: response.status().as_u16(),
            message: "push channel upgrade rejected".to_string(),
        },
        other => BackendError::transport(other),
    }
}

#[async_trait::async_trait]
impl PlanBackend for HttpBackend {
    async fn fetch_snapshot(&self, run_id: &RunId) -> Result<RunSnapshot, BackendError> {
        let response = self.get(self.url(&[run_id.as_str()])?).await?;
        let body: PlanResponse = response.json().await.map_err(BackendError::decode)?;
        Ok(body.into_snapshot())
    }

    async fn fetch_artifacts(&self, run_id: &RunId) -> Result<Vec<ArtifactDescriptor>, BackendError> {
        let response = self.get(self.url(&[run_id.as_str(), "artefacts"])?).await?;
        let body: ArtefactListResponse = response.json().await.map_err(BackendError::decode)?;
        Ok(body.artefacts.into_iter().map(Into::into).collect())
    }

    async fn fetch_file(
        &self,
        run_id: &RunId,
        filename: &str,
        max_bytes: u64,
    ) -> Result<FileContent, BackendError> {
        let response = self
            .get(self.url(&[run_id.as_str(), "files", filename])?)
            .await?;
        if let Some(length) = response.content_length()
            && length > max_bytes
        {
            return Err(BackendError::BodyTooLarge {
                limit: max_bytes,
                received: length,
            });
        }
        let content_type = content_type(&response);
        let bytes = read_capped(Box::pin(response.bytes_stream()), max_bytes).await?;
        Ok(FileContent {
            bytes,
            content_type,
        })
    }

    async fn open_stream(&self, run_id: &RunId) -> Result<FrameStream, BackendError> {
        let url = self.push_url(run_id)?;
        debug!(event = "ws.connect", url = %url, "opening push channel");
        let (socket, _) = tokio::time::timeout(self.timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| BackendError::transport(format!("push channel connect timed out after {:?}", self.timeout)))?
            .map_err(connect_error)?;
        Ok(frame_stream(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(HttpBackendConfig::new(base)).expect("backend")
    }

    fn chunks(parts: &[&'static str]) -> ByteStream {
        let items: Vec<Result<Bytes, reqwest::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        Box::pin(stream::iter(items))
    }

    #[test]
    fn urls_escape_path_segments() {
        let b = backend("http://localhost:8080/");
        assert_eq!(
            b.url(&["plan 1", "files", "a/b.md"]).expect("url").as_str(),
            "http://localhost:8080/api/plans/plan%201/files/a%2Fb.md"
        );
        let prefixed = backend("https://example.test/planner");
        assert_eq!(
            prefixed.url(&["p", "artefacts"]).expect("url").as_str(),
            "https://example.test/planner/api/plans/p/artefacts"
        );
    }

    #[test]
    fn push_url_switches_to_websocket_scheme() {
        assert_eq!(
            backend("http://localhost:8080/")
                .push_url(&RunId::new("plan 1"))
                .expect("url")
                .as_str(),
            "ws://localhost:8080/ws/plans/plan%201/progress"
        );
        assert_eq!(
            backend("https://example.test/planner")
                .push_url(&RunId::new("p"))
                .expect("url")
                .as_str(),
            "wss://example.test/planner/ws/plans/p/progress"
        );
    }

    #[test]
    fn invalid_base_urls_are_rejected() {
        assert!(matches!(
            HttpBackend::new(HttpBackendConfig::new("not a url")),
            Err(BackendError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpBackend::new(HttpBackendConfig::new("mailto:ops@example.test")),
            Err(BackendError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn text_messages_become_frames_until_close() {
        let messages = stream::iter(vec![
            Ok(Message::Text(r#"{"type":"heartbeat"}"#.to_string())),
            Ok(Message::Ping(vec![1])),
            Ok(Message::Text("  ".to_string())),
            Ok(Message::Binary(br#"{"type":"log","message":"x"}"#.to_vec())),
            Ok(Message::Close(None)),
            Ok(Message::Text("after close".to_string())),
        ]);
        let frames: Vec<String> = frame_stream(messages)
            .map(|r| r.expect("frame"))
            .collect()
            .await;
        assert_eq!(
            frames,
            vec![
                r#"{"type":"heartbeat"}"#.to_string(),
                r#"{"type":"log","message":"x"}"#.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn read_errors_end_the_stream() {
        let messages = stream::iter(vec![
            Ok(Message::Text("first".to_string())),
            Err(WsError::ConnectionClosed),
            Ok(Message::Text("never".to_string())),
        ]);
        let items: Vec<Result<String, BackendError>> = frame_stream(messages).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("first".to_string()));
        assert!(matches!(&items[1], Err(BackendError::Transport(m)) if m.contains("read failed")));
    }

    #[test]
    fn rejected_upgrade_keeps_the_status() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(404)
            .body(None)
            .expect("response");
        assert_eq!(
            connect_error(WsError::Http(response)),
            BackendError::Http {
                status: 404,
                message: "push channel upgrade rejected".into()
            }
        );
    }

    #[tokio::test]
    async fn capped_read_stops_past_limit() {
        let err = read_capped(chunks(&["12345", "67890", "abc"]), 8)
            .await
            .expect_err("too large");
        assert_eq!(err, BackendError::BodyTooLarge { limit: 8, received: 10 });
        let ok = read_capped(chunks(&["1234", "5678"]), 8).await.expect("fits");
        assert_eq!(&ok[..], b"12345678");
    }
}
