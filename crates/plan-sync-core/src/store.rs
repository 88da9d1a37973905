//! Authoritative run-level snapshot and the snapshot/push merge policy.

use tracing::debug;

use crate::event::StatusUpdate;
use crate::model::{RunId, RunSnapshot, RunStatus};

/// Result of one merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The stored snapshot changed.
    pub changed: bool,
    /// The stored status became terminal with this merge.
    pub became_terminal: bool,
    /// The incoming record was rejected as a whole (wrong run id).
    pub rejected: bool,
}

/// Owns the single [`RunSnapshot`] of the watched run.
///
/// Status and error text follow arrival order. While the run is `running`
/// progress only moves forward. A terminal status is accepted from either
/// source and is never replaced by a non-terminal one.
#[derive(Clone, Debug)]
pub struct PlanStateStore {
    run_id: RunId,
    current: Option<RunSnapshot>,
}

impl PlanStateStore {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            current: None,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn current(&self) -> Option<&RunSnapshot> {
        self.current.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.current.as_ref().is_some_and(|s| s.status.is_terminal())
    }

    /// Merges a polled snapshot.
    pub fn apply_snapshot(&mut self, incoming: RunSnapshot) -> MergeOutcome {
        if incoming.id != self.run_id {
            debug!(event = "store.snapshot_rejected", run_id = %self.run_id, incoming = %incoming.id, "snapshot for another run");
            return MergeOutcome {
                rejected: true,
                ..MergeOutcome::default()
            };
        }
        let Some(prev) = self.current.as_ref() else {
            let became_terminal = incoming.status.is_terminal();
            self.current = Some(RunSnapshot {
                stalled: false,
                ..incoming
            });
            return MergeOutcome {
                changed: true,
                became_terminal,
                rejected: false,
            };
        };

        let was_terminal = prev.status.is_terminal();
        let mut next = RunSnapshot {
            stalled: false,
            ..incoming
        };
        if was_terminal && !next.status.is_terminal() {
            debug!(event = "store.stale_snapshot", run_id = %self.run_id, status = %next.status, "keeping terminal status");
            next.status = prev.status;
            next.progress_percentage = prev.progress_percentage;
            next.progress_message = prev.progress_message.clone();
            next.error_message = prev.error_message.clone();
        } else if next.status == RunStatus::Running {
            next.progress_percentage = next.progress_percentage.max(prev.progress_percentage);
        }

        let changed = *prev != next;
        let became_terminal = !was_terminal && next.status.is_terminal();
        self.current = Some(next);
        MergeOutcome {
            changed,
            became_terminal,
            rejected: false,
        }
    }

    /// Field-patches the snapshot from a push `status` frame.
    pub fn apply_push_update(&mut self, update: &StatusUpdate) -> MergeOutcome {
        let prev = self
            .current
            .clone()
            .unwrap_or_else(|| RunSnapshot::empty(self.run_id.clone()));
        let was_terminal = self.is_terminal();
        let mut next = prev.clone();

        match update.status {
            Some(status) if was_terminal && !status.is_terminal() => {
                debug!(event = "store.stale_push", run_id = %self.run_id, status = %status, "ignoring non-terminal update after terminal status");
                return MergeOutcome::default();
            }
            Some(status) => {
                next.status = status;
                next.error_message = update.error_message().map(ToOwned::to_owned);
                if status != RunStatus::Failed
                    && let Some(message) = &update.message
                {
                    next.progress_message = message.clone();
                }
            }
            None => {
                if let Some(marker) = &update.marker {
                    debug!(event = "store.status_marker", run_id = %self.run_id, marker = %marker, "status marker carries no lifecycle change");
                }
                if was_terminal {
                    return MergeOutcome::default();
                }
            }
        }

        if let Some(progress) = update.progress_percentage {
            next.progress_percentage = if next.status.is_terminal() {
                progress
            } else {
                progress.max(prev.progress_percentage)
            };
        }
        if next.progress_percentage > prev.progress_percentage {
            next.stalled = false;
        }
        if update.stall_warning && !next.status.is_terminal() {
            next.stalled = true;
        }

        let changed = self.current.as_ref() != Some(&next);
        let became_terminal = !was_terminal && next.status.is_terminal();
        self.current = Some(next);
        MergeOutcome {
            changed,
            became_terminal,
            rejected: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: RunStatus, progress: u8) -> RunSnapshot {
        RunSnapshot {
            status,
            progress_percentage: progress,
            progress_message: format!("{progress}%"),
            ..RunSnapshot::empty(RunId::new("plan-1"))
        }
    }

    fn push(status: Option<RunStatus>, progress: Option<u8>) -> StatusUpdate {
        StatusUpdate {
            status,
            progress_percentage: progress,
            message: Some("working".into()),
            ..StatusUpdate::default()
        }
    }

    fn store() -> PlanStateStore {
        PlanStateStore::new(RunId::new("plan-1"))
    }

    #[test]
    fn empty_store_has_no_snapshot() {
        assert!(store().current().is_none());
    }

    #[test]
    fn stale_poll_does_not_rewind_progress() {
        let mut store = store();
        store.apply_snapshot(snapshot(RunStatus::Running, 10));
        store.apply_push_update(&push(Some(RunStatus::Running), Some(40)));
        store.apply_snapshot(snapshot(RunStatus::Running, 25));
        let current = store.current().expect("snapshot");
        assert_eq!(current.progress_percentage, 40);
        assert_eq!(current.progress_message, "25%");
    }

    #[test]
    fn push_before_any_snapshot_synthesises_one() {
        let mut store = store();
        let outcome = store.apply_push_update(&push(Some(RunStatus::Running), Some(5)));
        assert!(outcome.changed);
        let current = store.current().expect("snapshot");
        assert_eq!(current.id, RunId::new("plan-1"));
        assert_eq!(current.status, RunStatus::Running);
        assert_eq!(current.progress_percentage, 5);
        assert_eq!(current.created_at, None);
    }

    #[test]
    fn terminal_values_are_accepted_and_never_reverted() {
        let mut store = store();
        store.apply_snapshot(snapshot(RunStatus::Running, 80));
        let failed = StatusUpdate {
            status: Some(RunStatus::Failed),
            message: Some("exit code 1".into()),
            progress_percentage: Some(60),
            ..StatusUpdate::default()
        };
        let outcome = store.apply_push_update(&failed);
        assert!(outcome.became_terminal);
        let current = store.current().expect("snapshot");
        assert_eq!(current.progress_percentage, 60);
        assert_eq!(current.error_message.as_deref(), Some("exit code 1"));

        let outcome = store.apply_snapshot(snapshot(RunStatus::Running, 90));
        assert!(!outcome.became_terminal);
        assert_eq!(store.current().expect("snapshot").status, RunStatus::Failed);
        let outcome = store.apply_push_update(&push(Some(RunStatus::Running), Some(95)));
        assert!(!outcome.changed);
        assert_eq!(store.current().expect("snapshot").progress_percentage, 60);
    }

    #[test]
    fn terminal_snapshot_replaces_push_values() {
        let mut store = store();
        store.apply_push_update(&push(Some(RunStatus::Running), Some(70)));
        let outcome = store.apply_snapshot(snapshot(RunStatus::Completed, 100));
        assert!(outcome.became_terminal);
        let mut cancelled = snapshot(RunStatus::Cancelled, 50);
        cancelled.error_message = Some("stopped".into());
        store.apply_snapshot(cancelled);
        let current = store.current().expect("snapshot");
        assert_eq!(current.status, RunStatus::Cancelled);
        assert_eq!(current.progress_percentage, 50);
    }

    #[test]
    fn snapshot_for_other_run_is_rejected() {
        let mut store = store();
        let mut other = snapshot(RunStatus::Running, 10);
        other.id = RunId::new("plan-2");
        assert!(store.apply_snapshot(other).rejected);
        assert!(store.current().is_none());
    }

    #[test]
    fn stall_warning_set_and_cleared() {
        let mut store = store();
        store.apply_snapshot(snapshot(RunStatus::Running, 30));
        store.apply_push_update(&StatusUpdate {
            status: Some(RunStatus::Running),
            progress_percentage: Some(30),
            stall_warning: true,
            ..StatusUpdate::default()
        });
        assert!(store.current().expect("snapshot").stalled);
        store.apply_push_update(&push(Some(RunStatus::Running), Some(31)));
        assert!(!store.current().expect("snapshot").stalled);

        store.apply_push_update(&StatusUpdate {
            stall_warning: true,
            ..StatusUpdate::default()
        });
        assert!(store.current().expect("snapshot").stalled);
        store.apply_snapshot(snapshot(RunStatus::Running, 31));
        assert!(!store.current().expect("snapshot").stalled);
    }

    #[test]
    fn markers_do_not_change_status() {
        let mut store = store();
        store.apply_snapshot(snapshot(RunStatus::Running, 30));
        let outcome = store.apply_push_update(&StatusUpdate {
            marker: Some("stdout_closed".into()),
            message: Some("closed".into()),
            ..StatusUpdate::default()
        });
        assert!(!outcome.changed);
        assert_eq!(store.current().expect("snapshot").status, RunStatus::Running);
    }

    #[test]
    fn progress_never_decreases_across_interleavings() {
        // Small LCG keeps the interleaving deterministic.
        let mut seed: u64 = 0x5eed;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };
        for _ in 0..50 {
            let mut store = store();
            store.apply_snapshot(snapshot(RunStatus::Running, 0));
            let mut last = 0u8;
            for _ in 0..40 {
                let progress = (next() % 101) as u8;
                if next() % 2 == 0 {
                    store.apply_snapshot(snapshot(RunStatus::Running, progress));
                } else {
                    store.apply_push_update(&push(Some(RunStatus::Running), Some(progress)));
                }
                let current = store.current().expect("snapshot").progress_percentage;
                assert!(current >= last, "progress went from {last} to {current}");
                last = current;
            }
        }
    }
}
