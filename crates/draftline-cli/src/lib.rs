use anyhow::Context;
use draftline_core::models::RenderTaskPatch;
use draftline_core::{AppError, ErrorMetadata, LogLevel};
use draftline_worker::{RenderOrchestrator, RenderRequest};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::{
    fmt::format::Format, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

const DEFAULT_FILTER: &str = "draftline=info";

/// Initialize tracing for the CLI. Logs go to stderr so command output on
/// stdout stays machine readable. `log_format = "json"` switches to JSON lines.
pub fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(Format::default().compact().with_target(false))
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize response")?;
    println!("{}", out);
    Ok(())
}

/// Logs a failed command at the level its error calls for and returns the
/// JSON report printed to stderr.
pub fn report_error(err: &anyhow::Error) -> Value {
    let Some(app_err) = err.downcast_ref::<AppError>() else {
        let message = format!("{:#}", err);
        tracing::error!(error = %message, "Command failed");
        return serde_json::json!({
            "error": "CLI_ERROR",
            "message": message,
            "recoverable": false,
        });
    };

    let details = app_err.detailed_message();
    match app_err.log_level() {
        LogLevel::Debug => tracing::debug!(error = %details, "Command failed"),
        LogLevel::Warn => tracing::warn!(error = %details, "Command failed"),
        LogLevel::Error => tracing::error!(error = %details, "Command failed"),
    }
    serde_json::json!({
        "error": app_err.error_code(),
        "message": app_err.client_message(),
        "recoverable": app_err.is_recoverable(),
        "suggested_action": app_err.suggested_action(),
    })
}

/// Dispatches a render and, unless `detach` is set, waits for its watcher so
/// the outcome is recorded before the process exits. Returns what to print:
/// the final task row, or the dispatch when detached.
pub async fn run_render(
    orchestrator: &RenderOrchestrator,
    request: RenderRequest,
    detach: bool,
) -> anyhow::Result<Value> {
    let dispatch = orchestrator.dispatch_render(request).await?;
    if detach {
        tracing::warn!(
            task_id = %dispatch.task_id,
            "Detached from render; its outcome will not be recorded by this process"
        );
        return Ok(serde_json::to_value(&dispatch)?);
    }

    tracing::info!(task_id = %dispatch.task_id, "Waiting for render to finish");
    orchestrator.wait_for_watchers().await;
    let task = orchestrator.get_task(&dispatch.task_id).await?;
    Ok(serde_json::to_value(&task)?)
}

/// Parses a task patch given on the command line. Unknown keys are dropped.
pub fn parse_patch(raw: &str) -> anyhow::Result<RenderTaskPatch> {
    let patch: RenderTaskPatch =
        serde_json::from_str(raw).context("Patch must be a JSON object of task fields")?;
    patch.validate()?;
    Ok(patch)
}

pub fn parse_extra(raw: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(raw).context("--extra must be valid JSON")? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("--extra must be a JSON object, got {}", other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use draftline_core::models::{DraftDocument, RenderTaskStatus};
    use draftline_db::{MemoryDraftBackend, MemoryRenderTaskStore};
    use draftline_services::DraftStore;
    use draftline_worker::{InMemoryRenderQueue, RenderConfig, RenderQueue};

    async fn orchestrator_with_draft(watch_timeout: Duration) -> RenderOrchestrator {
        let drafts = Arc::new(DraftStore::new(Arc::new(MemoryDraftBackend::new()), 4));
        drafts.save("d1", &DraftDocument::default()).await.unwrap();
        let queue: Arc<dyn RenderQueue> = Arc::new(InMemoryRenderQueue::new());
        RenderOrchestrator::new(
            drafts,
            Arc::new(MemoryRenderTaskStore::new()),
            Some(queue),
            RenderConfig {
                poll_interval: Duration::from_millis(5),
                watch_timeout,
                ..Default::default()
            },
        )
    }

    fn render_request() -> RenderRequest {
        RenderRequest {
            draft_id: "d1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_render_records_outcome_before_returning() {
        let orchestrator = orchestrator_with_draft(Duration::from_millis(40)).await;

        let report = run_render(&orchestrator, render_request(), false)
            .await
            .unwrap();

        // The job never finishes, so the watcher gives up and records a failure
        assert_eq!(report["status"], "failed");
        assert_eq!(orchestrator.active_watchers(), 0);
        let task_id = report["task_id"].as_str().unwrap();
        let task = orchestrator.get_task(task_id).await.unwrap();
        assert_eq!(task.status, RenderTaskStatus::Failed);
    }

    #[tokio::test]
    async fn run_render_detached_returns_dispatch() {
        let orchestrator = orchestrator_with_draft(Duration::from_secs(60)).await;

        let report = run_render(&orchestrator, render_request(), true)
            .await
            .unwrap();

        assert!(report["task_id"].is_string());
        assert!(report.get("status").is_none());
        assert_eq!(orchestrator.active_watchers(), 1);
    }

    #[test]
    fn report_error_uses_app_error_metadata() {
        let err = anyhow::Error::from(AppError::NotFound("Task t1 not found".to_string()));
        let report = report_error(&err);
        assert_eq!(report["error"], "NOT_FOUND");
        assert_eq!(report["message"], "Task t1 not found");
        assert_eq!(report["recoverable"], false);
        assert!(report["suggested_action"].is_string());

        let wrapped = anyhow::Error::from(AppError::BackendUnavailable("redis down".to_string()))
            .context("dispatch failed");
        assert_eq!(report_error(&wrapped)["error"], "BACKEND_UNAVAILABLE");
    }

    #[test]
    fn report_error_handles_plain_errors() {
        let report = report_error(&anyhow::anyhow!("--extra must be valid JSON"));
        assert_eq!(report["error"], "CLI_ERROR");
        assert_eq!(report["message"], "--extra must be valid JSON");
    }

    #[test]
    fn parse_patch_keeps_known_fields() {
        let patch = parse_patch(r#"{"status": "processing", "progress": 40, "owner": "x"}"#)
            .unwrap();
        assert_eq!(patch.status, Some(RenderTaskStatus::Processing));
        assert_eq!(patch.progress, Some(40));
        assert!(patch.message.is_none());
    }

    #[test]
    fn parse_patch_rejects_out_of_range_progress() {
        assert!(parse_patch(r#"{"progress": 101}"#).is_err());
    }

    #[test]
    fn parse_patch_rejects_non_object() {
        assert!(parse_patch("[1, 2]").is_err());
    }

    #[test]
    fn parse_extra_requires_object() {
        assert!(parse_extra(None).unwrap().is_empty());
        let extra = parse_extra(Some(r#"{"unique_dir_name": "abc"}"#)).unwrap();
        assert_eq!(extra["unique_dir_name"], "abc");
        assert!(parse_extra(Some("42")).is_err());
    }
}
