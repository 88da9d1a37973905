//! Synchronisation state for watching a long-running pipeline run.
//!
//! Everything in this crate is synchronous and free of I/O. The client crate
//! drives it from a single task: transport frames go through
//! [`state::SyncState::apply_transport`], polled records through
//! [`state::SyncState::apply_snapshot`] and
//! [`state::SyncState::apply_artifacts`], and consumers read
//! [`state::EngineView`].
//!
//! ```
//! use chrono::Utc;
//! use plan_sync_core::{RunId, SyncConfig, SyncState, TransportEvent, classify_frame};
//!
//! let mut state = SyncState::new(SyncConfig::default());
//! state.watch(RunId::new("plan-1"));
//! let frame = r#"{"type":"llm_stream","interaction_id":7,"event":"text_delta","sequence":0,"data":{"delta":"Hi"}}"#;
//! state.apply_transport(TransportEvent::Frame(classify_frame(frame)), Utc::now());
//! let view = state.view(Utc::now());
//! assert_eq!(view.active_interaction.map(|s| s.text), Some("Hi".to_string()));
//! ```

/// Sync thresholds and their environment overrides.
pub mod config;
/// Push transport state as seen by consumers.
pub mod connection;
/// Error types.
pub mod errors;
/// Typed push events and frame classification.
pub mod event;
/// Run, snapshot and artifact records.
pub mod model;
/// Per-interaction stream accumulators.
pub mod multiplexer;
/// Process-wide logging setup.
pub mod observability;
/// Bounded copies of arbitrary payloads.
pub mod payload;
/// Reconnect backoff.
pub mod policy;
/// Preview classification and preview slot.
pub mod preview;
/// Fixed-capacity ring buffer.
pub mod ring;
/// Engine state and the derived view.
pub mod state;
/// Snapshot/push merge policy.
pub mod store;
/// Derived views.
pub mod views;

pub use config::SyncConfig;
pub use connection::{ConnectionState, ConnectionStatus, TransportMode};
pub use errors::{ConfigError, FrameError};
pub use event::{PushEvent, StatusUpdate, SubtaskEvent, SubtaskKind, classify_frame, decode_frame};
pub use model::{ArtifactDescriptor, RunId, RunSnapshot, RunStatus};
pub use multiplexer::{InteractionStatus, InteractionStream, StreamMultiplexer, UsageMetrics};
pub use observability::init_observability;
pub use policy::ReconnectPolicy;
pub use preview::{ContentClass, PreviewContent, PreviewFailure, PreviewState, PreviewStatus};
pub use state::{CloseReason, EngineView, LogLine, Reaction, SyncState, TransportEvent};
pub use store::PlanStateStore;
pub use views::{ProgressEstimate, StageSummary, UsageTotals};
