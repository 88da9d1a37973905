//! REST + WebSocket backend.
//!
//! Endpoint layout under the configured base URL:
//! - `GET /api/plans/{id}`: run snapshot
//! - `GET /api/plans/{id}/artefacts`: artifact list
//! - `GET /api/plans/{id}/files/{filename}`: raw file bytes
//! - `ws(s)://{host}/ws/plans/{id}/progress`: push frames, one JSON object per text message
mod client;
mod config;
mod wire;

pub use client::HttpBackend;
pub use config::HttpBackendConfig;
