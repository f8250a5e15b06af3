//! Render task orchestrator.
//!
//! `dispatch_render` registers the task row before the job chain is
//! published, so a worker can patch the row as soon as it picks the job up.
//! Each dispatched render gets its own watcher task on a [`TaskTracker`].

use std::sync::Arc;
use std::time::Duration;

use draftline_core::models::{NewRenderTask, RenderTask, RenderTaskPatch, RenderTaskStatus};
use draftline_core::{AppError, Config};
use draftline_db::RenderTaskStore;
use draftline_services::DraftStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::task::TaskTracker;

use crate::queue::{
    ChainHandle, JobChain, JobSignature, RenderQueue, GENERATE_VIDEO_TASK, PROCESS_DRAFT_TASK,
};
use crate::watcher::StatusWatcher;

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub queue_name: String,
    pub poll_interval: Duration,
    /// A render still running after this long is marked failed.
    pub watch_timeout: Duration,
    pub ping_timeout: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            poll_interval: Duration::from_millis(1000),
            watch_timeout: Duration::from_secs(6 * 60 * 60),
            ping_timeout: Duration::from_millis(1000),
        }
    }
}

impl RenderConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_name: config.render_queue_name.clone(),
            poll_interval: Duration::from_millis(config.render_poll_interval_ms),
            watch_timeout: Duration::from_secs(config.render_watch_timeout_secs),
            ping_timeout: Duration::from_millis(config.render_ping_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderRequest {
    pub draft_id: String,
    pub resolution: Option<String>,
    pub framerate: Option<String>,
    /// Replaces the draft name in the rendered content.
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderDispatch {
    pub task_id: String,
    /// Only known when the first stage finished before dispatch returned.
    pub unique_dir_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkPatchOutcome {
    pub draft_id: String,
    pub updated: usize,
    pub task_ids: Vec<String>,
}

pub struct RenderOrchestrator {
    drafts: Arc<DraftStore>,
    tasks: Arc<dyn RenderTaskStore>,
    queue: Option<Arc<dyn RenderQueue>>,
    config: RenderConfig,
    watchers: TaskTracker,
}

impl RenderOrchestrator {
    /// `queue` is `None` when no broker is configured; every dispatch then
    /// fails with a configuration error while task bookkeeping keeps working.
    pub fn new(
        drafts: Arc<DraftStore>,
        tasks: Arc<dyn RenderTaskStore>,
        queue: Option<Arc<dyn RenderQueue>>,
        config: RenderConfig,
    ) -> Self {
        Self {
            drafts,
            tasks,
            queue,
            config,
            watchers: TaskTracker::new(),
        }
    }

    #[tracing::instrument(skip(self, request), fields(draft_id = %request.draft_id))]
    pub async fn dispatch_render(&self, request: RenderRequest) -> Result<RenderDispatch, AppError> {
        if request.draft_id.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "The required parameter 'draft_id' is missing".to_string(),
            ));
        }

        let draft = self.drafts.fetch(&request.draft_id).await?;

        let queue = self.queue.clone().ok_or_else(|| {
            AppError::Configuration(
                "CELERY_BROKER_URL and CELERY_RESULT_BACKEND are required to render".to_string(),
            )
        })?;

        let content = draft.to_render_content(request.name.as_deref())?;
        let video_name = content
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);

        match queue.ping(self.config.ping_timeout).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "No render worker answered the ping; check that workers share this broker"
            ),
            Err(e) => tracing::warn!(error = %e, "Render queue ping failed"),
        }

        let task_id = uuid::Uuid::new_v4().simple().to_string();

        self.tasks
            .upsert_initialized(
                NewRenderTask::new(&task_id, &request.draft_id).with_video_name(video_name),
            )
            .await?;

        let chain = JobChain::new(
            &self.config.queue_name,
            vec![
                JobSignature::new(PROCESS_DRAFT_TASK).kwarg("draft_content", content),
                JobSignature::new(GENERATE_VIDEO_TASK)
                    .kwarg("output_path", Value::Null)
                    .kwarg("resolution", opt_string(&request.resolution))
                    .kwarg("framerate", opt_string(&request.framerate))
                    .with_task_id(&task_id),
            ],
        );

        let handle = match queue.submit_chain(&chain).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to submit render chain");
                let message = format!("Failed to submit render job: {}", e);
                if let Err(write_err) = self
                    .tasks
                    .finish(&task_id, RenderTaskStatus::Failed, Some(message.clone()))
                    .await
                {
                    tracing::error!(task_id = %task_id, error = %write_err, "Failed to mark render task failed");
                }
                return Err(AppError::BackendUnavailable(message));
            }
        };
        tracing::info!(task_id = %task_id, "Render chain dispatched");

        let unique_dir_name = self.record_early_metadata(&*queue, &task_id, &handle).await;

        let watcher = StatusWatcher::new(
            queue,
            self.tasks.clone(),
            self.config.poll_interval,
            self.config.watch_timeout,
        );
        let watched_id = task_id.clone();
        self.watchers.spawn(async move { watcher.run(watched_id).await });

        Ok(RenderDispatch {
            task_id,
            unique_dir_name,
        })
    }

    /// Picks up `unique_dir_name` when the first stage already finished.
    async fn record_early_metadata(
        &self,
        queue: &dyn RenderQueue,
        task_id: &str,
        handle: &ChainHandle,
    ) -> Option<String> {
        let first = handle.first().filter(|first| *first != task_id)?;
        let unique_dir_name = match queue.job_status(first).await {
            Ok(status) => status.unique_dir_name()?,
            Err(e) => {
                tracing::debug!(error = %e, "Could not read first stage status");
                return None;
            }
        };

        let mut extra = Map::new();
        extra.insert(
            "unique_dir_name".to_string(),
            Value::String(unique_dir_name.clone()),
        );
        let patch = RenderTaskPatch {
            extra: Some(extra),
            ..Default::default()
        };
        if let Err(e) = self.tasks.patch(task_id, &patch).await {
            tracing::error!(task_id = %task_id, error = %e, "Failed to store early render metadata");
        }
        Some(unique_dir_name)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<RenderTask, AppError> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))
    }

    /// Registers a task row. Creating an id that already exists returns the
    /// stored row unchanged.
    #[tracing::instrument(skip(self, extra))]
    pub async fn create_task(
        &self,
        task_id: &str,
        draft_id: &str,
        extra: Map<String, Value>,
    ) -> Result<RenderTask, AppError> {
        if task_id.trim().is_empty() || draft_id.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "task_id and draft_id are required".to_string(),
            ));
        }
        self.tasks
            .create_if_absent(NewRenderTask::new(task_id, draft_id).with_extra(extra))
            .await
    }

    /// An empty patch succeeds without writing anything.
    #[tracing::instrument(skip(self, patch))]
    pub async fn patch_task(
        &self,
        task_id: &str,
        patch: &RenderTaskPatch,
    ) -> Result<RenderTask, AppError> {
        if patch.is_empty() {
            return self.get_task(task_id).await;
        }
        self.tasks
            .patch(task_id, patch)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))
    }

    /// Applies the patch to every task of the draft. Finished tasks keep their
    /// status while the other fields are still written.
    #[tracing::instrument(skip(self, patch))]
    pub async fn patch_tasks_by_draft(
        &self,
        draft_id: &str,
        patch: &RenderTaskPatch,
    ) -> Result<BulkPatchOutcome, AppError> {
        if patch.is_empty() {
            return Err(AppError::NoValidFields);
        }
        let task_ids = self.tasks.patch_by_draft(draft_id, patch).await?;
        if task_ids.is_empty() {
            return Err(AppError::NotFound(format!(
                "No tasks found for draft {}",
                draft_id
            )));
        }
        Ok(BulkPatchOutcome {
            draft_id: draft_id.to_string(),
            updated: task_ids.len(),
            task_ids,
        })
    }

    pub async fn list_tasks_for_draft(&self, draft_id: &str) -> Result<Vec<RenderTask>, AppError> {
        self.tasks.list_for_draft(draft_id).await
    }

    /// Number of watchers still polling.
    pub fn active_watchers(&self) -> usize {
        self.watchers.len()
    }

    /// Waits until every watcher spawned so far has recorded its outcome.
    pub async fn wait_for_watchers(&self) {
        self.watchers.close();
        self.watchers.wait().await;
        self.watchers.reopen();
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}
