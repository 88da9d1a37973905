//! Async runtime around `plan-sync-core`: backend access, the push transport,
//! polling, previews and the engine facade that ties them together.
//!
//! # Watching a run
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use plan_sync_client::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(HttpBackend::new(HttpBackendConfig::new("http://localhost:8080"))?);
//! let engine = PlanSyncEngine::builder(backend)
//!     .config(SyncConfig::from_env()?)
//!     .spawn()?;
//! engine.watch_run("PlanExe_20250926").await?;
//!
//! let mut views = engine.subscribe();
//! while views.changed().await.is_ok() {
//!     let view = views.borrow_and_update().clone();
//!     if let Some(run) = &view.run {
//!         println!("{} {}%", run.status.as_str(), run.progress_percentage);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Backend contract consumed by the engine.
pub mod backend;
/// Engine builder, handle and task loop.
pub mod engine;
/// Public error types.
pub mod errors;
/// REST and WebSocket implementation of the backend contract.
pub mod http;
/// Snapshot and artifact polling.
pub mod poller;
/// Common imports for typical usage.
pub mod prelude;
/// Artifact preview fetching.
pub mod preview;
/// Push channel with reconnect and fallback.
pub mod transport;

pub use backend::{FileContent, FrameStream, PlanBackend};
pub use engine::{EngineBuilder, EngineHandle, PlanSyncEngine};
pub use errors::{BackendError, EngineError, PreviewError};
pub use http::{HttpBackend, HttpBackendConfig};
pub use preview::{PreviewService, fetch_preview};
pub use transport::{TransportAdapter, TransportHandle};
