//! Push channel lifecycle: connect, reconnect with backoff, fall back to pull.

use std::sync::Arc;

use futures::StreamExt as _;
use plan_sync_core::state::{CloseReason, TransportEvent};
use plan_sync_core::{PushEvent, ReconnectPolicy, RunId, classify_frame};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::PlanBackend;

/// Owns the push connection for one run.
pub struct TransportAdapter {
    backend: Arc<dyn PlanBackend>,
    policy: ReconnectPolicy,
}

impl TransportAdapter {
    pub fn new(backend: Arc<dyn PlanBackend>, policy: ReconnectPolicy) -> Self {
        Self { backend, policy }
    }

    /// Starts the connection loop for `run_id`; events go to `events`.
    ///
    /// The loop ends when the stream ends, the retry budget is spent, the
    /// handle is closed or dropped, or `events` is closed.
    pub fn connect(&self, run_id: RunId, events: mpsc::Sender<TransportEvent>) -> TransportHandle {
        let (abort_tx, abort_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(
            self.backend.clone(),
            self.policy.clone(),
            run_id,
            events,
            abort_rx,
        ));
        TransportHandle { abort_tx, task }
    }
}

/// Handle to a running connection loop. Dropping it closes the connection.
pub struct TransportHandle {
    abort_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Requests the loop to stop. Any pending backoff is cancelled.
    pub fn close(&self) {
        let _ = self.abort_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Tells the owner, if it is still listening, that its close request was honoured.
fn closed_by_owner(events: &mpsc::Sender<TransportEvent>) {
    let _ = events.try_send(TransportEvent::Closed {
        reason: CloseReason::Requested,
    });
}

/// Resolves once an abort was requested or the handle is gone.
async fn aborted(abort_rx: &mut watch::Receiver<bool>) {
    loop {
        if *abort_rx.borrow_and_update() {
            return;
        }
        if abort_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn connection_loop(
    backend: Arc<dyn PlanBackend>,
    policy: ReconnectPolicy,
    run_id: RunId,
    events: mpsc::Sender<TransportEvent>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let connection_id = uuid::Uuid::new_v4();
    let emit = |event: TransportEvent| {
        let events = events.clone();
        async move { events.send(event).await.is_ok() }
    };
    let mut failed_attempts = 0u32;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if !emit(TransportEvent::Connecting { attempt }).await {
            return;
        }
        debug!(event = "transport.connecting", %run_id, %connection_id, attempt, "opening push channel");

        let opened = tokio::select! {
            _ = aborted(&mut abort_rx) => {
                closed_by_owner(&events);
                return;
            }
            opened = backend.open_stream(&run_id) => opened,
        };

        let error = match opened {
            Ok(mut stream) => {
                failed_attempts = 0;
                info!(event = "transport.connected", %run_id, %connection_id, attempt, "push channel connected");
                if !emit(TransportEvent::Connected).await {
                    return;
                }
                loop {
                    let next = tokio::select! {
                        _ = aborted(&mut abort_rx) => {
                            debug!(event = "transport.closed", %run_id, %connection_id, "push channel closed by owner");
                            closed_by_owner(&events);
                            return;
                        }
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(text)) => {
                            let frame = classify_frame(&text);
                            let ended = matches!(frame, PushEvent::StreamEnd { .. });
                            if !emit(TransportEvent::Frame(frame)).await {
                                return;
                            }
                            if ended {
                                info!(event = "transport.stream_end", %run_id, %connection_id, "backend finished streaming");
                                let _ = emit(TransportEvent::Closed {
                                    reason: CloseReason::StreamEnded,
                                })
                                .await;
                                return;
                            }
                        }
                        Some(Err(err)) => break err.to_string(),
                        None => break "push channel closed by backend".to_string(),
                    }
                }
            }
            Err(err) => err.to_string(),
        };

        failed_attempts += 1;
        if !policy.can_retry(failed_attempts) {
            warn!(event = "transport.fallback", %run_id, %connection_id, failed_attempts, error = %error, "retry budget exhausted; falling back to polling");
            if emit(TransportEvent::Failed {
                error,
                failed_attempts,
                retry_in: None,
            })
            .await
            {
                let _ = emit(TransportEvent::FallbackToPull { failed_attempts }).await;
            }
            return;
        }

        let delay = policy.backoff_duration(failed_attempts);
        warn!(event = "transport.retry", %run_id, %connection_id, failed_attempts, delay_ms = delay.as_millis() as u64, error = %error, "push channel failed; retrying");
        if !emit(TransportEvent::Failed {
            error,
            failed_attempts,
            retry_in: Some(delay),
        })
        .await
        {
            return;
        }
        tokio::select! {
            _ = aborted(&mut abort_rx) => {
                debug!(event = "transport.closed", %run_id, %connection_id, "backoff cancelled by owner");
                closed_by_owner(&events);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
