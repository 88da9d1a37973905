//! Pure functions deriving display views from the multiplexer and artifacts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{ArtifactDescriptor, RunSnapshot};
use crate::multiplexer::{InteractionStatus, InteractionStream, StreamMultiplexer, UNKNOWN_STAGE};

/// Pipeline stages in execution order.
pub const CANONICAL_STAGES: &[&str] = &[
    "setup",
    "initial_analysis",
    "strategic_planning",
    "scenario_planning",
    "contextual_analysis",
    "assumption_management",
    "project_planning",
    "governance",
    "resource_planning",
    "documentation",
    "team_building",
    "expert_review",
    "wbs",
    "scheduling",
    "reporting",
    "completion",
];

const STAGE_LABELS: &[(&str, &str)] = &[
    ("wbs", "Work Breakdown Structure"),
    ("expert_review", "Expert Review"),
    ("assumption_management", "Assumptions"),
    ("contextual_analysis", "Context Analysis"),
    ("completion", "Final Outputs"),
    (UNKNOWN_STAGE, "Other"),
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub key: String,
    pub label: String,
    pub artifact_count: usize,
    pub interaction_count: usize,
}

/// Trimmed, lowercased stage key; blank or missing becomes `"unknown"`.
pub fn normalize_stage_key(raw: Option<&str>) -> String {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(key) => key.to_ascii_lowercase(),
        None => UNKNOWN_STAGE.to_string(),
    }
}

/// Display label for a stage key.
pub fn stage_label(key: &str) -> String {
    if let Some((_, label)) = STAGE_LABELS.iter().find(|(k, _)| *k == key) {
        return (*label).to_string();
    }
    key.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Per-stage counts, canonical stages first, then the rest alphabetically.
pub fn stage_summary<'a>(
    artifacts: &[ArtifactDescriptor],
    interactions: impl IntoIterator<Item = &'a InteractionStream>,
) -> Vec<StageSummary> {
    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for artifact in artifacts {
        counts
            .entry(normalize_stage_key(artifact.stage.as_deref()))
            .or_default()
            .0 += 1;
    }
    for stream in interactions {
        counts
            .entry(normalize_stage_key(Some(&stream.stage)))
            .or_default()
            .1 += 1;
    }

    let rank = |key: &str| {
        CANONICAL_STAGES
            .iter()
            .position(|stage| *stage == key)
            .unwrap_or(CANONICAL_STAGES.len())
    };
    let mut summary: Vec<StageSummary> = counts
        .into_iter()
        .map(|(key, (artifact_count, interaction_count))| StageSummary {
            label: stage_label(&key),
            key,
            artifact_count,
            interaction_count,
        })
        .collect();
    // BTreeMap already yields keys alphabetically; the stable sort keeps that within a rank.
    summary.sort_by_key(|s| rank(&s.key));
    summary
}

/// The active interaction, if any.
pub fn active_interaction(mux: &StreamMultiplexer) -> Option<InteractionStream> {
    mux.active().map(InteractionStream::summary)
}

/// Terminal interactions, most recently updated first.
pub fn interaction_history(mux: &StreamMultiplexer) -> Vec<InteractionStream> {
    let mut history: Vec<&InteractionStream> = mux
        .interactions()
        .values()
        .filter(|stream| stream.is_terminal())
        .collect();
    history.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.interaction_id.cmp(&a.interaction_id))
    });
    history.into_iter().map(InteractionStream::summary).collect()
}

/// Advisory throughput numbers; never overrides the snapshot's own progress.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEstimate {
    pub elapsed_secs: u64,
    pub completed_interactions: usize,
    pub expected_total_tasks: u32,
    pub tasks_per_minute: Option<f64>,
    pub estimated_remaining_secs: Option<u64>,
}

pub fn progress_estimate(
    run: &RunSnapshot,
    mux: &StreamMultiplexer,
    now: DateTime<Utc>,
    expected_total_tasks: u32,
) -> Option<ProgressEstimate> {
    let created_at = run.created_at?;
    let elapsed_secs = u64::try_from(now.signed_duration_since(created_at).num_seconds()).ok()?;
    let completed_interactions = mux
        .interactions()
        .values()
        .filter(|s| s.status == InteractionStatus::Completed)
        .count();

    let tasks_per_minute = (elapsed_secs > 0 && completed_interactions > 0)
        .then(|| completed_interactions as f64 * 60.0 / elapsed_secs as f64);
    let estimated_remaining_secs = tasks_per_minute.map(|rate| {
        let remaining = (expected_total_tasks as usize).saturating_sub(completed_interactions);
        (remaining as f64 / rate * 60.0).round() as u64
    });
    Some(ProgressEstimate {
        elapsed_secs,
        completed_interactions,
        expected_total_tasks,
        tasks_per_minute,
        estimated_remaining_secs,
    })
}

/// Token usage summed over every interaction that reported typed usage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
    pub interactions_with_usage: usize,
}

pub fn usage_totals(mux: &StreamMultiplexer) -> UsageTotals {
    mux.interactions()
        .values()
        .filter_map(|s| s.usage.as_ref())
        .fold(UsageTotals::default(), |mut acc, usage| {
            acc.input_tokens += usage.input_tokens.unwrap_or(0);
            acc.output_tokens += usage.output_tokens.unwrap_or(0);
            acc.total_tokens += usage.total_tokens.unwrap_or(0);
            acc.reasoning_tokens += usage.reasoning_tokens.unwrap_or(0);
            acc.interactions_with_usage += 1;
            acc
        })
}
