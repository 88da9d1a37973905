use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where run updates are coming from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Push channel plus poller.
    #[default]
    Push,
    /// Push retry budget exhausted; the poller is the only source.
    Pull,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
    Closed,
}

/// Observable state of the push transport for the current run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub mode: TransportMode,
    pub status: ConnectionStatus,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Consecutive failed connection attempts since the last successful connect.
    pub failed_attempts: u32,
    /// Set when a sequence gap was observed; consumers should refresh out of band.
    pub resync_hint: bool,
    /// Total sequence gaps observed on this connection.
    pub gap_count: u64,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    /// Successful connect: back to push mode, attempt counter reset.
    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        self.status = ConnectionStatus::Connected;
        self.mode = TransportMode::Push;
        self.failed_attempts = 0;
        self.last_error = None;
        self.last_event_at = Some(now);
    }

    pub fn mark_error(&mut self, error: impl Into<String>, failed_attempts: u32) {
        self.status = ConnectionStatus::Error;
        self.last_error = Some(error.into());
        self.failed_attempts = failed_attempts;
    }

    /// Retry budget exhausted: stay in `error`, rely on polling only.
    pub fn mark_fallback(&mut self) {
        self.status = ConnectionStatus::Error;
        self.mode = TransportMode::Pull;
    }

    pub fn mark_closed(&mut self) {
        self.status = ConnectionStatus::Closed;
    }

    pub fn record_event(&mut self, now: DateTime<Utc>) {
        self.last_event_at = Some(now);
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_event_at = Some(now);
        self.last_heartbeat_at = Some(now);
    }

    pub fn flag_resync(&mut self) {
        self.resync_hint = true;
        self.gap_count = self.gap_count.saturating_add(1);
    }

    pub fn acknowledge_resync(&mut self) {
        self.resync_hint = false;
    }

    /// Connected and something arrived within `stale_after`.
    pub fn is_live(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.status != ConnectionStatus::Connected {
            return false;
        }
        let latest = match (self.last_event_at, self.last_heartbeat_at) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return false,
        };
        let Ok(window) = chrono::Duration::from_std(stale_after) else {
            return true;
        };
        now.signed_duration_since(latest) <= window
    }
}
