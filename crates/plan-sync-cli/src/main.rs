//! `plan-watch`: follow a live pipeline run from the terminal.

use std::sync::Arc;

use clap::Parser;
use plan_sync_client::prelude::*;
use plan_sync_core::init_observability;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "plan-watch")]
#[command(about = "Follow a live pipeline run until it finishes")]
struct Cli {
    /// Run to watch.
    run_id: String,
    #[arg(long, env = "PLAN_SYNC_BASE_URL", default_value = "http://localhost:8080")]
    base_url: String,
    /// Print a preview of this artifact once it shows up.
    #[arg(long)]
    preview: Option<String>,
    /// Print every view as one JSON line.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_observability();

    let backend = HttpBackend::new(HttpBackendConfig::from_env().base_url(cli.base_url.clone()))?;
    let engine = PlanSyncEngine::builder(Arc::new(backend))
        .config(SyncConfig::from_env()?)
        .spawn()?;
    info!(event = "cli.watch", run_id = %cli.run_id, base_url = %cli.base_url, "watching run");
    engine.watch_run(cli.run_id.as_str()).await?;

    let mut views = engine.subscribe();
    let mut last_line = String::new();
    let mut preview_requested = false;
    let mut preview_printed = false;
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        let view = views.borrow_and_update().clone();

        if !preview_requested
            && let Some(name) = &cli.preview
            && let Some(artifact) = view.artifacts.iter().find(|a| &a.filename == name)
        {
            engine.select_preview(Some(artifact.clone())).await?;
            preview_requested = true;
        }

        let line = if cli.json {
            serde_json::to_string(&view)?
        } else {
            render(&view)
        };
        if line != last_line {
            println!("{line}");
            last_line = line;
        }

        if !preview_printed && let Some(text) = render_preview(&view.preview.status) {
            println!("{text}");
            preview_printed = true;
        }

        if finished(&view) {
            break;
        }
    }

    if let Some(name) = &cli.preview
        && !preview_requested
    {
        eprintln!("artifact {name} was not produced by this run");
    }
    engine.shutdown().await?;
    Ok(())
}

/// Terminal run whose push side has nothing more to say.
fn finished(view: &EngineView) -> bool {
    let terminal = view.run.as_ref().is_some_and(|run| run.status.is_terminal());
    let quiet = view.connection.status == ConnectionStatus::Closed
        || view.connection.mode == TransportMode::Pull;
    terminal && quiet && view.preview.status != PreviewStatus::Loading
}

fn render(view: &EngineView) -> String {
    let Some(run) = &view.run else {
        return format!("waiting for run ({})", connection_label(view));
    };
    let mut line = format!(
        "[{}] {:>3}% {}",
        run.status.as_str(),
        run.progress_percentage,
        run.progress_message
    );
    if run.stalled {
        line.push_str(" (stalled)");
    }
    if let Some(error) = &run.error_message {
        line.push_str(&format!(" error: {error}"));
    }
    line.push_str(&format!(" | {}", connection_label(view)));
    if let Some(active) = &view.active_interaction {
        line.push_str(&format!(
            " | #{} {} ({} chars)",
            active.interaction_id,
            active.stage,
            active.text.chars().count()
        ));
    }
    let stages: Vec<String> = view
        .stage_summary
        .iter()
        .filter(|s| s.artifact_count > 0 || s.interaction_count > 0)
        .map(|s| format!("{}={}/{}", s.key, s.artifact_count, s.interaction_count))
        .collect();
    if !stages.is_empty() {
        line.push_str(&format!(" | {}", stages.join(" ")));
    }
    line
}

fn connection_label(view: &EngineView) -> String {
    let mode = match view.connection.mode {
        TransportMode::Push => "push",
        TransportMode::Pull => "pull",
    };
    let status = match view.connection.status {
        ConnectionStatus::Idle => "idle",
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Connected if view.live => "live",
        ConnectionStatus::Connected => "quiet",
        ConnectionStatus::Error => "error",
        ConnectionStatus::Closed => "closed",
    };
    format!("{mode}/{status}")
}

fn render_preview(status: &PreviewStatus) -> Option<String> {
    match status {
        PreviewStatus::Ready(content) => Some(format!(
            "--- {} ({}, {} bytes) ---\n{}",
            content.filename, content.content_type, content.size_bytes, content.body
        )),
        PreviewStatus::Failed(failure) => Some(format!("preview failed: {}", failure.message)),
        PreviewStatus::Idle | PreviewStatus::Loading => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plan_sync_core::{RunSnapshot, StageSummary};

    fn view_with(status: RunStatus, progress: u8) -> EngineView {
        EngineView {
            run: Some(RunSnapshot {
                status,
                progress_percentage: progress,
                progress_message: "Running task 25 of 61".into(),
                ..RunSnapshot::empty(RunId::new("plan-1"))
            }),
            ..EngineView::default()
        }
    }

    #[test]
    fn renders_status_progress_and_stage_counts() {
        let mut view = view_with(RunStatus::Running, 41);
        view.connection.status = ConnectionStatus::Connected;
        view.live = true;
        view.stage_summary = vec![
            StageSummary {
                key: "wbs".into(),
                label: "Work Breakdown Structure".into(),
                artifact_count: 2,
                interaction_count: 3,
            },
            StageSummary {
                key: "setup".into(),
                label: "Setup".into(),
                artifact_count: 0,
                interaction_count: 0,
            },
        ];
        assert_eq!(
            render(&view),
            "[running]  41% Running task 25 of 61 | push/live | wbs=2/3"
        );
    }

    #[test]
    fn finishes_once_terminal_and_push_is_done() {
        let mut view = view_with(RunStatus::Completed, 100);
        view.connection.status = ConnectionStatus::Connected;
        assert!(!finished(&view));
        view.connection.status = ConnectionStatus::Closed;
        assert!(finished(&view));

        let mut fallback = view_with(RunStatus::Failed, 60);
        fallback.connection.mode = TransportMode::Pull;
        assert!(finished(&fallback));
        fallback.preview.status = PreviewStatus::Loading;
        assert!(!finished(&fallback));
    }
}
