use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::multiplexer::MultiplexerLimits;
use crate::policy::ReconnectPolicy;

/// Tunable thresholds of the sync engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Snapshot poll interval while the run is not terminal.
    #[serde(default = "default_snapshot_poll_ms")]
    pub snapshot_poll_interval_ms: u64,
    /// Artifact list poll interval.
    #[serde(default = "default_artifact_poll_ms")]
    pub artifact_poll_interval_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Preview size ceiling in bytes.
    #[serde(default = "default_preview_max_bytes")]
    pub preview_max_bytes: u64,
    /// Raw deltas kept per interaction for diagnostics.
    #[serde(default = "default_delta_ring_capacity")]
    pub delta_ring_capacity: usize,
    /// Event records kept per interaction.
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
    /// Log and unclassified lines kept for the view.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Task count of a full pipeline run, used for the ETA.
    #[serde(default = "default_expected_total_tasks")]
    pub expected_total_tasks: u32,
    /// A connected channel with no frame for this long is not live.
    #[serde(default = "default_heartbeat_stale_after_ms")]
    pub heartbeat_stale_after_ms: u64,
}

const fn default_snapshot_poll_ms() -> u64 {
    3_000
}

const fn default_artifact_poll_ms() -> u64 {
    5_000
}

const fn default_preview_max_bytes() -> u64 {
    2 * 1024 * 1024
}

const fn default_delta_ring_capacity() -> usize {
    200
}

const fn default_event_history_capacity() -> usize {
    100
}

const fn default_log_capacity() -> usize {
    200
}

const fn default_expected_total_tasks() -> u32 {
    61
}

const fn default_heartbeat_stale_after_ms() -> u64 {
    60_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_poll_interval_ms: default_snapshot_poll_ms(),
            artifact_poll_interval_ms: default_artifact_poll_ms(),
            reconnect: ReconnectPolicy::default(),
            preview_max_bytes: default_preview_max_bytes(),
            delta_ring_capacity: default_delta_ring_capacity(),
            event_history_capacity: default_event_history_capacity(),
            log_capacity: default_log_capacity(),
            expected_total_tasks: default_expected_total_tasks(),
            heartbeat_stale_after_ms: default_heartbeat_stale_after_ms(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `PLAN_SYNC_*` environment variables.
    ///
    /// - `PLAN_SYNC_SNAPSHOT_POLL_MS`
    /// - `PLAN_SYNC_ARTIFACT_POLL_MS`
    /// - `PLAN_SYNC_RECONNECT_ATTEMPTS`
    /// - `PLAN_SYNC_RECONNECT_MAX_BACKOFF_MS`
    /// - `PLAN_SYNC_PREVIEW_MAX_BYTES`
    /// - `PLAN_SYNC_TOTAL_TASKS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "PLAN_SYNC_SNAPSHOT_POLL_MS")? {
            config.snapshot_poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAN_SYNC_ARTIFACT_POLL_MS")? {
            config.artifact_poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAN_SYNC_RECONNECT_ATTEMPTS")? {
            config.reconnect.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAN_SYNC_RECONNECT_MAX_BACKOFF_MS")? {
            config.reconnect.max_backoff_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAN_SYNC_PREVIEW_MAX_BYTES")? {
            config.preview_max_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAN_SYNC_TOTAL_TASKS")? {
            config.expected_total_tasks = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn snapshot_poll_interval_ms(mut self, ms: u64) -> Self {
        self.snapshot_poll_interval_ms = ms;
        self
    }

    pub fn artifact_poll_interval_ms(mut self, ms: u64) -> Self {
        self.artifact_poll_interval_ms = ms;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn preview_max_bytes(mut self, bytes: u64) -> Self {
        self.preview_max_bytes = bytes;
        self
    }

    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn expected_total_tasks(mut self, tasks: u32) -> Self {
        self.expected_total_tasks = tasks;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("snapshot_poll_interval_ms", self.snapshot_poll_interval_ms == 0),
            ("artifact_poll_interval_ms", self.artifact_poll_interval_ms == 0),
            ("reconnect.initial_backoff_ms", self.reconnect.initial_backoff_ms == 0),
            ("reconnect.max_backoff_ms", self.reconnect.max_backoff_ms == 0),
            ("preview_max_bytes", self.preview_max_bytes == 0),
            ("delta_ring_capacity", self.delta_ring_capacity == 0),
            ("event_history_capacity", self.event_history_capacity == 0),
            ("log_capacity", self.log_capacity == 0),
            ("heartbeat_stale_after_ms", self.heartbeat_stale_after_ms == 0),
        ];
        match checks.into_iter().find(|(_, zero)| *zero) {
            Some((field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }

    pub fn snapshot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_poll_interval_ms)
    }

    pub fn artifact_poll_interval(&self) -> Duration {
        Duration::from_millis(self.artifact_poll_interval_ms)
    }

    pub fn heartbeat_stale_after(&self) -> Duration {
        Duration::from_millis(self.heartbeat_stale_after_ms)
    }

    pub fn multiplexer_limits(&self) -> MultiplexerLimits {
        MultiplexerLimits {
            delta_ring_capacity: self.delta_ring_capacity,
            event_history_capacity: self.event_history_capacity,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = SyncConfig::default();
        assert_eq!(config.snapshot_poll_interval(), Duration::from_secs(3));
        assert_eq!(config.artifact_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.preview_max_bytes, 2 * 1024 * 1024);
        assert_eq!(config.delta_ring_capacity, 200);
        assert_eq!(config.expected_total_tasks, 61);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("PLAN_SYNC_SNAPSHOT_POLL_MS", "4000"),
            ("PLAN_SYNC_RECONNECT_ATTEMPTS", " 3 "),
            ("PLAN_SYNC_PREVIEW_MAX_BYTES", ""),
        ]))
        .expect("config");
        assert_eq!(config.snapshot_poll_interval_ms, 4_000);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.preview_max_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("PLAN_SYNC_TOTAL_TASKS", "many")]))
            .expect_err("invalid");
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                key: "PLAN_SYNC_TOTAL_TASKS",
                value: "many".into()
            }
        );
        let err = SyncConfig::from_lookup(lookup(&[("PLAN_SYNC_ARTIFACT_POLL_MS", "0")]))
            .expect_err("zero");
        assert_eq!(err, ConfigError::Zero { field: "artifact_poll_interval_ms" });
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"preview_max_bytes": 1024, "reconnect": {"max_attempts": 2}}"#)
                .expect("json");
        assert_eq!(config.preview_max_bytes, 1_024);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.initial_backoff_ms, 1_000);
        assert_eq!(config.log_capacity, 200);
    }
}
