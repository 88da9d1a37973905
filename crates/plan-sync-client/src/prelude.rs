//! Common imports for watching a run.
pub use crate::{
    BackendError, EngineError, EngineHandle, HttpBackend, HttpBackendConfig, PlanBackend,
    PlanSyncEngine,
};
pub use plan_sync_core::{
    ArtifactDescriptor, ConnectionStatus, EngineView, InteractionStatus, PreviewStatus, RunId,
    RunStatus, SyncConfig, TransportMode,
};
