//! Per-run engine state: connection, multiplexer, store, artifacts, preview
//! and log tail, plus the read-only view derived from them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::ConnectionState;
use crate::event::PushEvent;
use crate::model::{ArtifactDescriptor, RunId, RunSnapshot, sort_artifacts};
use crate::multiplexer::{InteractionStream, StreamMultiplexer};
use crate::preview::PreviewState;
use crate::ring::BoundedRing;
use crate::store::{MergeOutcome, PlanStateStore};
use crate::views::{
    ProgressEstimate, StageSummary, UsageTotals, active_interaction, interaction_history,
    progress_estimate, stage_summary, usage_totals,
};

/// Typed events emitted by the transport adapter.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Connecting { attempt: u32 },
    Connected,
    Frame(PushEvent),
    /// A connection attempt failed or an open channel dropped.
    Failed {
        error: String,
        failed_attempts: u32,
        retry_in: Option<Duration>,
    },
    /// Retry budget exhausted; polling is the only source from now on.
    FallbackToPull { failed_attempts: u32 },
    Closed { reason: CloseReason },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Backend reported the run finished streaming.
    StreamEnded,
    /// The owner closed the adapter.
    Requested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Log,
    Error,
    StreamEnd,
    /// Unclassified frame passed through verbatim.
    Raw,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub kind: LogKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// What a state change asks the owner to do next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    pub changed: bool,
    /// A sequence gap was seen; refresh snapshot and artifacts out of band.
    pub resync: bool,
    /// The run status just became terminal.
    pub run_terminal: bool,
    /// The push channel announced the end of the stream.
    pub stream_ended: bool,
}

impl Reaction {
    fn changed() -> Self {
        Self {
            changed: true,
            ..Self::default()
        }
    }

    fn from_merge(outcome: MergeOutcome) -> Self {
        Self {
            changed: outcome.changed,
            run_terminal: outcome.became_terminal,
            ..Self::default()
        }
    }
}

/// Read-only snapshot handed to consumers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EngineView {
    pub run_id: Option<RunId>,
    pub run: Option<RunSnapshot>,
    pub connection: ConnectionState,
    /// Connected and heard from within the staleness window.
    pub live: bool,
    pub active_interaction: Option<InteractionStream>,
    pub interaction_history: Vec<InteractionStream>,
    pub stage_summary: Vec<StageSummary>,
    pub artifacts: Vec<ArtifactDescriptor>,
    pub preview: PreviewState,
    pub progress_estimate: Option<ProgressEstimate>,
    pub usage_totals: UsageTotals,
    pub logs: Vec<LogLine>,
}

struct RunState {
    store: PlanStateStore,
    connection: ConnectionState,
    multiplexer: StreamMultiplexer,
    artifacts: Vec<ArtifactDescriptor>,
    logs: BoundedRing<LogLine>,
}

impl RunState {
    fn new(run_id: RunId, config: &SyncConfig) -> Self {
        Self {
            store: PlanStateStore::new(run_id),
            connection: ConnectionState::new(),
            multiplexer: StreamMultiplexer::new(config.multiplexer_limits()),
            artifacts: Vec::new(),
            logs: BoundedRing::new(config.log_capacity),
        }
    }

    fn log(&mut self, kind: LogKind, message: impl Into<String>, timestamp: DateTime<Utc>) {
        self.logs.push(LogLine {
            kind,
            message: message.into(),
            timestamp,
        });
    }
}

/// All state of the watched run. Mutated only by the engine task.
pub struct SyncState {
    config: SyncConfig,
    run: Option<RunState>,
    preview: PreviewState,
}

impl SyncState {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            run: None,
            preview: PreviewState::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.run.as_ref().map(|r| r.store.run_id())
    }

    /// Starts watching `run_id`, discarding everything from the previous run.
    pub fn watch(&mut self, run_id: RunId) {
        info!(event = "state.watch", run_id = %run_id, "resetting state for new run");
        self.run = Some(RunState::new(run_id, &self.config));
        self.preview = PreviewState::default();
    }

    pub fn clear(&mut self) {
        if let Some(run_id) = self.run_id() {
            info!(event = "state.clear", run_id = %run_id, "clearing watched run");
        }
        self.run = None;
        self.preview = PreviewState::default();
    }

    pub fn snapshot(&self) -> Option<&RunSnapshot> {
        self.run.as_ref().and_then(|r| r.store.current())
    }

    pub fn connection(&self) -> Option<&ConnectionState> {
        self.run.as_ref().map(|r| &r.connection)
    }

    pub fn multiplexer(&self) -> Option<&StreamMultiplexer> {
        self.run.as_ref().map(|r| &r.multiplexer)
    }

    pub fn artifacts(&self) -> &[ArtifactDescriptor] {
        match &self.run {
            Some(run) => &run.artifacts,
            None => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.run.as_ref().is_some_and(|r| r.store.is_terminal())
    }

    pub fn preview(&self) -> &PreviewState {
        &self.preview
    }

    pub fn set_preview(&mut self, preview: PreviewState) {
        self.preview = preview;
    }

    pub fn apply_transport(&mut self, event: TransportEvent, now: DateTime<Utc>) -> Reaction {
        let Some(run) = self.run.as_mut() else {
            debug!(event = "state.transport_without_run", "no run watched; dropping transport event");
            return Reaction::default();
        };
        match event {
            TransportEvent::Connecting { attempt } => {
                debug!(event = "state.connecting", run_id = %run.store.run_id(), attempt, "push channel connecting");
                run.connection.mark_connecting();
                Reaction::changed()
            }
            TransportEvent::Connected => {
                run.connection.mark_connected(now);
                Reaction::changed()
            }
            TransportEvent::Failed {
                error,
                failed_attempts,
                ..
            } => {
                run.connection.mark_error(error, failed_attempts);
                Reaction::changed()
            }
            TransportEvent::FallbackToPull { failed_attempts } => {
                warn!(event = "state.fallback", run_id = %run.store.run_id(), failed_attempts, "push unavailable; relying on polling");
                run.connection.mark_fallback();
                Reaction::changed()
            }
            TransportEvent::Closed { .. } => {
                run.connection.mark_closed();
                Reaction::changed()
            }
            TransportEvent::Frame(frame) => Self::apply_frame(run, frame, now),
        }
    }

    fn apply_frame(run: &mut RunState, frame: PushEvent, now: DateTime<Utc>) -> Reaction {
        if matches!(frame, PushEvent::Heartbeat { .. }) {
            run.connection.record_heartbeat(now);
        } else {
            run.connection.record_event(now);
        }
        match frame {
            PushEvent::Status(update) => Reaction::from_merge(run.store.apply_push_update(&update)),
            PushEvent::Heartbeat { .. } => Reaction::changed(),
            PushEvent::Subtask(event) => {
                if let Some(event_run) = &event.run_id
                    && event_run != run.store.run_id()
                {
                    debug!(event = "state.foreign_subtask", run_id = %run.store.run_id(), event_run = %event_run, "dropping subtask event for another run");
                    return Reaction::default();
                }
                let Some(outcome) = run.multiplexer.handle(&event, now) else {
                    return Reaction::default();
                };
                let mut reaction = Reaction::changed();
                if outcome.gap() {
                    debug!(event = "state.sequence_gap", interaction_id = outcome.interaction_id, sequence = ?event.sequence, "sequence gap; requesting resync");
                    run.connection.flag_resync();
                    reaction.resync = true;
                }
                reaction
            }
            PushEvent::StreamEnd { message } => {
                run.log(
                    LogKind::StreamEnd,
                    message.unwrap_or_else(|| "stream ended".to_string()),
                    now,
                );
                Reaction {
                    changed: true,
                    stream_ended: true,
                    ..Reaction::default()
                }
            }
            PushEvent::Error { message } => {
                warn!(event = "state.stream_error", run_id = %run.store.run_id(), error = %message, "backend reported a stream error");
                run.connection.last_error = Some(message.clone());
                run.log(LogKind::Error, message, now);
                Reaction::changed()
            }
            PushEvent::Log { message, timestamp } => {
                run.log(LogKind::Log, message, timestamp.unwrap_or(now));
                Reaction::changed()
            }
            PushEvent::Raw { text } => {
                run.log(LogKind::Raw, text, now);
                Reaction::changed()
            }
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: RunSnapshot) -> Reaction {
        match self.run.as_mut() {
            Some(run) => Reaction::from_merge(run.store.apply_snapshot(snapshot)),
            None => Reaction::default(),
        }
    }

    pub fn apply_artifacts(&mut self, mut artifacts: Vec<ArtifactDescriptor>) -> Reaction {
        let Some(run) = self.run.as_mut() else {
            return Reaction::default();
        };
        sort_artifacts(&mut artifacts);
        if run.artifacts == artifacts {
            return Reaction::default();
        }
        run.artifacts = artifacts;
        Reaction::changed()
    }

    pub fn acknowledge_resync(&mut self) {
        if let Some(run) = self.run.as_mut() {
            run.connection.acknowledge_resync();
        }
    }

    pub fn view(&self, now: DateTime<Utc>) -> EngineView {
        let Some(run) = &self.run else {
            return EngineView {
                preview: self.preview.clone(),
                ..EngineView::default()
            };
        };
        let snapshot = run.store.current().cloned();
        let progress_estimate = snapshot.as_ref().and_then(|s| {
            progress_estimate(s, &run.multiplexer, now, self.config.expected_total_tasks)
        });
        EngineView {
            run_id: Some(run.store.run_id().clone()),
            run: snapshot,
            connection: run.connection.clone(),
            live: run
                .connection
                .is_live(now, self.config.heartbeat_stale_after()),
            active_interaction: active_interaction(&run.multiplexer),
            interaction_history: interaction_history(&run.multiplexer),
            stage_summary: stage_summary(&run.artifacts, run.multiplexer.interactions().values()),
            artifacts: run.artifacts.clone(),
            preview: self.preview.clone(),
            progress_estimate,
            usage_totals: usage_totals(&run.multiplexer),
            logs: run.logs.iter().cloned().collect(),
        }
    }
}
