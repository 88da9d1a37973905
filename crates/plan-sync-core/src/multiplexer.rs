//! Per-interaction accumulators rebuilt from out-of-order push events.
//!
//! Events are applied in arrival order. Deltas that arrive before their
//! `start` create a placeholder stream instead of being dropped, `final`
//! values replace the assembled buffers, and a terminal stream never goes
//! back to `running`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::event::{FinalPayload, SubtaskEvent, SubtaskKind};
use crate::model::RunId;
use crate::payload::sanitize_payload;
use crate::ring::BoundedRing;

/// Stage key used until an event names the stage.
pub const UNKNOWN_STAGE: &str = "unknown";

const MAX_PENDING_SEQUENCES: usize = 1_024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionStatus {
    Running,
    Completed,
    Failed,
}

impl InteractionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Token usage normalised from a flat `usage` record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UsageMetrics {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
}

impl UsageMetrics {
    /// Accepts only a flat object whose keys are all known numeric fields.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.is_empty() {
            return None;
        }
        let mut usage = UsageMetrics::default();
        for (key, raw) in obj {
            let slot = match key.as_str() {
                "input_tokens" | "prompt_tokens" => &mut usage.input_tokens,
                "output_tokens" | "completion_tokens" => &mut usage.output_tokens,
                "total_tokens" => &mut usage.total_tokens,
                "reasoning_tokens" => &mut usage.reasoning_tokens,
                "cached_tokens" | "cached_input_tokens" => &mut usage.cached_tokens,
                _ => return None,
            };
            match raw {
                Value::Null => {}
                Value::Number(n) => {
                    *slot = n
                        .as_u64()
                        .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64));
                    slot.as_ref()?;
                }
                _ => return None,
            }
        }
        if usage.total_tokens.is_none()
            && let (Some(i), Some(o)) = (usage.input_tokens, usage.output_tokens)
        {
            usage.total_tokens = Some(i.saturating_add(o));
        }
        Some(usage)
    }
}

/// Diagnostic record of one received event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventRecord {
    pub sequence: Option<u64>,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Text,
    Reasoning,
}

/// Raw delta kept in the diagnostic ring. Not used to rebuild content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeltaRecord {
    pub sequence: Option<u64>,
    pub kind: DeltaKind,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// How an incoming sequence number relates to what was already seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceObservation {
    /// No sequence number on the event.
    Unsequenced,
    /// The next expected value.
    InOrder,
    /// Ahead of the next expected value: something is missing or late.
    Gap,
    /// Already seen.
    Duplicate,
}

/// Tracks which sequence numbers of one interaction have been seen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct SequenceTracker {
    /// Every sequence below this value has been seen.
    next_expected: u64,
    /// Seen sequences above `next_expected`.
    ahead: BTreeSet<u64>,
    highest: Option<u64>,
}

impl SequenceTracker {
    fn observe(&mut self, sequence: Option<u64>) -> SequenceObservation {
        let Some(seq) = sequence else {
            return SequenceObservation::Unsequenced;
        };
        if seq < self.next_expected || self.ahead.contains(&seq) {
            return SequenceObservation::Duplicate;
        }
        self.highest = Some(self.highest.map_or(seq, |h| h.max(seq)));
        if seq == self.next_expected {
            self.next_expected += 1;
            while self.ahead.remove(&self.next_expected) {
                self.next_expected += 1;
            }
            return SequenceObservation::InOrder;
        }
        self.ahead.insert(seq);
        if self.ahead.len() > MAX_PENDING_SEQUENCES {
            // Give up on the hole; everything up to the highest seen counts as seen.
            self.next_expected = self.highest.map_or(0, |h| h + 1);
            self.ahead.clear();
        }
        SequenceObservation::Gap
    }

    /// Starts over at a restart's sequence: it and everything below count as seen.
    fn restart_at(&mut self, sequence: Option<u64>) {
        *self = match sequence {
            Some(seq) => Self {
                next_expected: seq + 1,
                ahead: BTreeSet::new(),
                highest: Some(seq),
            },
            None => Self::default(),
        };
    }
}

/// Buffer sizes applied to every interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultiplexerLimits {
    pub delta_ring_capacity: usize,
    pub event_history_capacity: usize,
}

impl Default for MultiplexerLimits {
    fn default() -> Self {
        Self {
            delta_ring_capacity: 200,
            event_history_capacity: 100,
        }
    }
}

/// Accumulated state of one interaction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InteractionStream {
    pub interaction_id: i64,
    pub run_id: Option<RunId>,
    pub stage: String,
    pub prompt_preview: Option<String>,
    pub status: InteractionStatus,
    /// Assembled text: concatenated deltas, replaced by `final` text.
    pub text: String,
    /// Assembled reasoning: newline-joined deltas, replaced by `final` reasoning.
    pub reasoning: String,
    pub final_text: Option<String>,
    pub final_reasoning: Option<String>,
    pub usage: Option<UsageMetrics>,
    /// Usage record that did not match the known flat shape, sanitised.
    pub usage_raw: Option<Value>,
    pub raw_payload: Option<Value>,
    pub error: Option<String>,
    /// Whether a `start` event has been applied (false for placeholders).
    pub started: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub gap_detected: bool,
    #[serde(skip)]
    events: BoundedRing<EventRecord>,
    #[serde(skip)]
    raw_deltas: BoundedRing<DeltaRecord>,
    #[serde(skip)]
    sequences: SequenceTracker,
}

impl InteractionStream {
    fn new(interaction_id: i64, limits: MultiplexerLimits, now: DateTime<Utc>) -> Self {
        Self {
            interaction_id,
            run_id: None,
            stage: UNKNOWN_STAGE.to_string(),
            prompt_preview: None,
            status: InteractionStatus::Running,
            text: String::new(),
            reasoning: String::new(),
            final_text: None,
            final_reasoning: None,
            usage: None,
            usage_raw: None,
            raw_payload: None,
            error: None,
            started: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            gap_detected: false,
            events: BoundedRing::new(limits.event_history_capacity),
            raw_deltas: BoundedRing::new(limits.delta_ring_capacity),
            sequences: SequenceTracker::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Highest sequence number seen for this interaction.
    pub fn last_sequence(&self) -> Option<u64> {
        self.sequences.highest
    }

    pub fn events(&self) -> &BoundedRing<EventRecord> {
        &self.events
    }

    pub fn raw_deltas(&self) -> &BoundedRing<DeltaRecord> {
        &self.raw_deltas
    }

    /// Copy for published views. The event and delta rings stay behind;
    /// read them through the multiplexer.
    pub fn summary(&self) -> InteractionStream {
        InteractionStream {
            interaction_id: self.interaction_id,
            run_id: self.run_id.clone(),
            stage: self.stage.clone(),
            prompt_preview: self.prompt_preview.clone(),
            status: self.status,
            text: self.text.clone(),
            reasoning: self.reasoning.clone(),
            final_text: self.final_text.clone(),
            final_reasoning: self.final_reasoning.clone(),
            usage: self.usage.clone(),
            usage_raw: self.usage_raw.clone(),
            raw_payload: self.raw_payload.clone(),
            error: self.error.clone(),
            started: self.started,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            gap_detected: self.gap_detected,
            events: BoundedRing::new(self.events.capacity()),
            raw_deltas: BoundedRing::new(self.raw_deltas.capacity()),
            sequences: self.sequences.clone(),
        }
    }

    fn absorb_metadata(&mut self, event: &SubtaskEvent) {
        if let Some(stage) = event.stage.as_deref().map(str::trim).filter(|s| !s.is_empty())
            && self.stage == UNKNOWN_STAGE
        {
            self.stage = stage.to_string();
        }
        if self.run_id.is_none() {
            self.run_id = event.run_id.clone();
        }
    }

    fn reinitialize(&mut self) {
        self.status = InteractionStatus::Running;
        self.text.clear();
        self.reasoning.clear();
        self.final_text = None;
        self.final_reasoning = None;
        self.usage = None;
        self.usage_raw = None;
        self.raw_payload = None;
        self.error = None;
        self.completed_at = None;
        self.raw_deltas.clear();
        self.gap_detected = false;
    }

    fn append_delta(&mut self, kind: DeltaKind, delta: &str, sequence: Option<u64>, now: DateTime<Utc>) {
        if delta.is_empty() {
            return;
        }
        match kind {
            DeltaKind::Text => self.text.push_str(delta),
            DeltaKind::Reasoning => {
                if !self.reasoning.is_empty() {
                    self.reasoning.push('\n');
                }
                self.reasoning.push_str(delta);
            }
        }
        self.raw_deltas.push(DeltaRecord {
            sequence,
            kind,
            text: delta.to_string(),
            received_at: now,
        });
    }

    fn apply_final(&mut self, payload: &FinalPayload) {
        if let Some(text) = &payload.text {
            self.text = text.clone();
            self.final_text = Some(text.clone());
        }
        if let Some(reasoning) = &payload.reasoning {
            self.reasoning = reasoning.clone();
            self.final_reasoning = Some(reasoning.clone());
        }
        if let Some(usage) = &payload.usage {
            match UsageMetrics::from_value(usage) {
                Some(metrics) => {
                    self.usage = Some(metrics);
                    self.usage_raw = None;
                }
                None => self.usage_raw = Some(sanitize_payload(usage)),
            }
        }
        if let Some(raw) = &payload.raw_payload {
            self.raw_payload = Some(sanitize_payload(raw));
        }
    }
}

/// What applying one event did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleOutcome {
    pub interaction_id: i64,
    pub sequence: SequenceObservation,
    /// A placeholder accumulator was synthesised for an unseen id.
    pub created: bool,
    /// The interaction reached a terminal status with this event.
    pub became_terminal: bool,
}

impl HandleOutcome {
    pub fn gap(&self) -> bool {
        self.sequence == SequenceObservation::Gap
    }
}

/// Owns one accumulator per interaction id plus the active pointer.
#[derive(Clone, Debug)]
pub struct StreamMultiplexer {
    limits: MultiplexerLimits,
    interactions: BTreeMap<i64, InteractionStream>,
    active: Option<i64>,
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new(MultiplexerLimits::default())
    }
}

impl StreamMultiplexer {
    pub fn new(limits: MultiplexerLimits) -> Self {
        Self {
            limits,
            interactions: BTreeMap::new(),
            active: None,
        }
    }

    pub fn interactions(&self) -> &BTreeMap<i64, InteractionStream> {
        &self.interactions
    }

    pub fn get(&self, interaction_id: i64) -> Option<&InteractionStream> {
        self.interactions.get(&interaction_id)
    }

    pub fn active_id(&self) -> Option<i64> {
        self.active
    }

    pub fn active(&self) -> Option<&InteractionStream> {
        self.active.and_then(|id| self.interactions.get(&id))
    }

    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Drops every accumulator (run id changed).
    pub fn reset(&mut self) {
        self.interactions.clear();
        self.active = None;
    }

    /// Applies one event. Returns `None` when the event kind is not recognised.
    pub fn handle(&mut self, event: &SubtaskEvent, now: DateTime<Utc>) -> Option<HandleOutcome> {
        if let SubtaskKind::Unknown(name) = &event.kind {
            debug!(event = "mux.unknown_kind", interaction_id = event.interaction_id, kind = %name, "ignoring subtask event");
            return None;
        }

        let id = event.interaction_id;
        let limits = self.limits;
        let created = !self.interactions.contains_key(&id);
        let stream = self
            .interactions
            .entry(id)
            .or_insert_with(|| InteractionStream::new(id, limits, now));
        let observation = stream.sequences.observe(event.sequence);
        if observation == SequenceObservation::Gap {
            stream.gap_detected = true;
        }
        stream.absorb_metadata(event);
        stream.updated_at = now;
        stream.events.push(EventRecord {
            sequence: event.sequence,
            kind: event.kind.name().to_string(),
            timestamp: event.timestamp.unwrap_or(now),
            payload: sanitize_payload(&event.payload),
        });

        let was_terminal = stream.is_terminal();
        let mut make_active = created && !was_terminal;
        match &event.kind {
            SubtaskKind::Start { prompt_preview } => {
                if !was_terminal {
                    let restart = stream.started && observation != SequenceObservation::Duplicate;
                    if restart {
                        debug!(event = "mux.restart", interaction_id = id, "reinitialising interaction on repeated start");
                        stream.reinitialize();
                        stream.sequences.restart_at(event.sequence);
                    }
                    stream.started = true;
                    make_active = true;
                }
                if prompt_preview.is_some() {
                    stream.prompt_preview = prompt_preview.clone();
                }
            }
            SubtaskKind::TextDelta { delta } => {
                if observation != SequenceObservation::Duplicate {
                    stream.append_delta(DeltaKind::Text, delta, event.sequence, now);
                }
            }
            SubtaskKind::ReasoningDelta { delta } => {
                if observation != SequenceObservation::Duplicate {
                    stream.append_delta(DeltaKind::Reasoning, delta, event.sequence, now);
                }
            }
            SubtaskKind::Final(payload) => stream.apply_final(payload),
            SubtaskKind::End { failed, error } => {
                if !was_terminal {
                    stream.status = if *failed {
                        InteractionStatus::Failed
                    } else {
                        InteractionStatus::Completed
                    };
                    stream.error = error.clone();
                    stream.completed_at = Some(now);
                }
                make_active = false;
            }
            SubtaskKind::Unknown(_) => {}
        }
        let became_terminal = !was_terminal && stream.is_terminal();

        if make_active {
            self.active = Some(id);
        } else if became_terminal && self.active == Some(id) {
            self.active = None;
        }

        Some(HandleOutcome {
            interaction_id: id,
            sequence: observation,
            created,
            became_terminal,
        })
    }
}
