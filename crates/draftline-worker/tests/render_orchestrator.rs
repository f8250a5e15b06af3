use std::sync::Arc;
use std::time::Duration;

use draftline_core::models::{DraftDocument, RenderTaskPatch, RenderTaskStatus};
use draftline_core::AppError;
use draftline_db::{MemoryDraftBackend, MemoryRenderTaskStore};
use draftline_services::DraftStore;
use draftline_worker::queue::{GENERATE_VIDEO_TASK, PROCESS_DRAFT_TASK};
use draftline_worker::{
    InMemoryRenderQueue, RenderConfig, RenderOrchestrator, RenderQueue, RenderRequest,
};
use serde_json::{json, Map, Value};

struct Harness {
    drafts: Arc<DraftStore>,
    tasks: Arc<MemoryRenderTaskStore>,
    queue: Arc<InMemoryRenderQueue>,
    orchestrator: RenderOrchestrator,
}

fn fast_config() -> RenderConfig {
    RenderConfig {
        poll_interval: Duration::from_millis(10),
        watch_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

fn harness_with(config: RenderConfig) -> Harness {
    let drafts = Arc::new(DraftStore::new(Arc::new(MemoryDraftBackend::new()), 16));
    let tasks = Arc::new(MemoryRenderTaskStore::new());
    let queue = Arc::new(InMemoryRenderQueue::new());
    let render_queue: Arc<dyn RenderQueue> = queue.clone();
    let orchestrator =
        RenderOrchestrator::new(drafts.clone(), tasks.clone(), Some(render_queue), config);
    Harness {
        drafts,
        tasks,
        queue,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(fast_config())
}

fn request(draft_id: &str) -> RenderRequest {
    RenderRequest {
        draft_id: draft_id.to_string(),
        resolution: Some("1080P".to_string()),
        framerate: Some("30fps".to_string()),
        name: None,
    }
}

async fn drain(orchestrator: &RenderOrchestrator) {
    tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_for_watchers())
        .await
        .expect("watchers did not finish");
}

#[tokio::test]
async fn test_unknown_draft_is_not_dispatched() {
    let h = harness();

    let err = h
        .orchestrator
        .dispatch_render(request("missing"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)));
    assert!(h.queue.submissions().is_empty());
    assert!(h.tasks.is_empty());
}

#[tokio::test]
async fn test_missing_draft_id_is_invalid() {
    let h = harness();
    let err = h.orchestrator.dispatch_render(request("  ")).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_dispatch_registers_initialized_task() {
    let h = harness();
    h.drafts
        .save("d1", &DraftDocument::new(1080, 1920).with_name("teaser"))
        .await
        .unwrap();

    let dispatch = h.orchestrator.dispatch_render(request("d1")).await.unwrap();
    assert_eq!(dispatch.task_id.len(), 32);
    assert!(dispatch.unique_dir_name.is_none());

    let task = h.orchestrator.get_task(&dispatch.task_id).await.unwrap();
    assert_eq!(task.status, RenderTaskStatus::Initialized);
    assert_eq!(task.draft_id, "d1");
    assert_eq!(task.video_name.as_deref(), Some("teaser"));

    let submissions = h.queue.submissions();
    assert_eq!(submissions.len(), 1);
    let submitted = &submissions[0];
    assert_eq!(submitted.chain.queue, "default");
    assert_eq!(submitted.chain.stages[0].task, PROCESS_DRAFT_TASK);
    assert_eq!(submitted.chain.stages[0].kwargs["draft_content"]["width"], 1080);
    assert_eq!(submitted.chain.stages[1].task, GENERATE_VIDEO_TASK);
    assert_eq!(submitted.chain.stages[1].kwargs["resolution"], "1080P");
    assert_eq!(submitted.handle.last(), Some(dispatch.task_id.as_str()));
    assert_eq!(h.orchestrator.active_watchers(), 1);
}

#[tokio::test]
async fn test_name_override_reaches_content_and_task() {
    let h = harness();
    h.drafts
        .save("d1", &DraftDocument::new(1080, 1920).with_name("draft name"))
        .await
        .unwrap();

    let dispatch = h
        .orchestrator
        .dispatch_render(RenderRequest {
            name: Some("launch video".to_string()),
            ..request("d1")
        })
        .await
        .unwrap();

    let submitted = &h.queue.submissions()[0];
    assert_eq!(
        submitted.chain.stages[0].kwargs["draft_content"]["name"],
        "launch video"
    );
    let task = h.orchestrator.get_task(&dispatch.task_id).await.unwrap();
    assert_eq!(task.video_name.as_deref(), Some("launch video"));
}

#[tokio::test]
async fn test_dispatch_without_queue_is_configuration_error() {
    let drafts = Arc::new(DraftStore::new(Arc::new(MemoryDraftBackend::new()), 16));
    let tasks = Arc::new(MemoryRenderTaskStore::new());
    let orchestrator = RenderOrchestrator::new(drafts.clone(), tasks.clone(), None, fast_config());
    drafts.save("d1", &DraftDocument::default()).await.unwrap();

    let err = orchestrator.dispatch_render(request("d1")).await.unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn test_submission_failure_marks_task_failed() {
    let h = harness();
    h.drafts.save("d1", &DraftDocument::default()).await.unwrap();
    h.queue.set_offline(true);

    let err = h.orchestrator.dispatch_render(request("d1")).await.unwrap_err();
    assert!(matches!(err, AppError::BackendUnavailable(_)));

    let tasks = h.orchestrator.list_tasks_for_draft("d1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, RenderTaskStatus::Failed);
    assert!(tasks[0].message.as_deref().unwrap().contains("offline"));
    assert_eq!(h.orchestrator.active_watchers(), 0);
}

#[tokio::test]
async fn test_idle_workers_do_not_block_dispatch() {
    let h = harness();
    h.drafts.save("d1", &DraftDocument::default()).await.unwrap();
    h.queue.set_workers_idle(true);

    assert!(h.orchestrator.dispatch_render(request("d1")).await.is_ok());
    assert_eq!(h.queue.submissions().len(), 1);
}

#[tokio::test]
async fn test_early_unique_dir_name_is_recorded() {
    let h = harness();
    h.drafts.save("d1", &DraftDocument::default()).await.unwrap();
    h.queue
        .set_first_stage_result(Some(json!({"unique_dir_name": "draft_d1_4821"})));

    let dispatch = h.orchestrator.dispatch_render(request("d1")).await.unwrap();
    assert_eq!(dispatch.unique_dir_name.as_deref(), Some("draft_d1_4821"));

    let task = h.orchestrator.get_task(&dispatch.task_id).await.unwrap();
    assert_eq!(task.extra["unique_dir_name"], "draft_d1_4821");
}

#[tokio::test]
async fn test_watcher_marks_success_completed() {
    let h = harness();
    h.drafts.save("d1", &DraftDocument::default()).await.unwrap();
    let dispatch = h.orchestrator.dispatch_render(request("d1")).await.unwrap();

    h.queue
        .complete(&dispatch.task_id, json!({"output": "s3://renders/d1.mp4"}));
    drain(&h.orchestrator).await;

    let task = h.orchestrator.get_task(&dispatch.task_id).await.unwrap();
    assert_eq!(task.status, RenderTaskStatus::Completed);
    assert_eq!(h.orchestrator.active_watchers(), 0);
}

#[tokio::test]
async fn test_watcher_marks_failure_with_message() {
    let h = harness();
    h.drafts.save("d1", &DraftDocument::default()).await.unwrap();
    let dispatch = h.orchestrator.dispatch_render(request("d1")).await.unwrap();

    h.queue.fail(&dispatch.task_id, "encode error");
    drain(&h.orchestrator).await;

    let task = h.orchestrator.get_task(&dispatch.task_id).await.unwrap();
    assert_eq!(task.status, RenderTaskStatus::Failed);
    assert_eq!(task.message.as_deref(), Some("encode error"));
}

#[tokio::test]
async fn test_watcher_survives_poll_errors() {
    let h = harness();
    h.drafts.save("d1", &DraftDocument::default()).await.unwrap();
    let dispatch = h.orchestrator.dispatch_render(request("d1")).await.unwrap();

    h.queue.set_offline(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.queue.set_offline(false);
    h.queue.complete(&dispatch.task_id, Value::Null);
    drain(&h.orchestrator).await;

    let task = h.orchestrator.get_task(&dispatch.task_id).await.unwrap();
    assert_eq!(task.status, RenderTaskStatus::Completed);
}

#[tokio::test]
async fn test_watcher_gives_up_after_timeout() {
    let h = harness_with(RenderConfig {
        watch_timeout: Duration::from_millis(60),
        ..fast_config()
    });
    h.drafts.save("d1", &DraftDocument::default()).await.unwrap();
    let dispatch = h.orchestrator.dispatch_render(request("d1")).await.unwrap();

    drain(&h.orchestrator).await;

    let task = h.orchestrator.get_task(&dispatch.task_id).await.unwrap();
    assert_eq!(task.status, RenderTaskStatus::Failed);
    assert!(task.message.as_deref().unwrap().contains("did not finish"));
}

#[tokio::test]
async fn test_watcher_keeps_status_reported_by_worker() {
    let h = harness();
    h.drafts.save("d1", &DraftDocument::default()).await.unwrap();
    let dispatch = h.orchestrator.dispatch_render(request("d1")).await.unwrap();

    h.orchestrator
        .patch_task(
            &dispatch.task_id,
            &RenderTaskPatch {
                status: Some(RenderTaskStatus::Completed),
                progress: Some(100),
                draft_url: Some("https://cdn.example.com/d1.mp4".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.queue.fail(&dispatch.task_id, "late failure");
    drain(&h.orchestrator).await;

    let task = h.orchestrator.get_task(&dispatch.task_id).await.unwrap();
    assert_eq!(task.status, RenderTaskStatus::Completed);
    assert_eq!(task.progress, Some(100));
    assert_eq!(task.message, None);
}

#[tokio::test]
async fn test_create_task_is_idempotent() {
    let h = harness();
    let mut extra = Map::new();
    extra.insert("source".to_string(), json!("mcp"));

    let first = h
        .orchestrator
        .create_task("t1", "d1", extra)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .create_task("t1", "d2", Map::new())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.draft_id, "d1");
    assert_eq!(second.extra["source"], "mcp");
    assert_eq!(h.tasks.len(), 1);

    assert!(matches!(
        h.orchestrator.create_task("", "d1", Map::new()).await,
        Err(AppError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_empty_patches() {
    let h = harness();
    h.orchestrator
        .create_task("t1", "d1", Map::new())
        .await
        .unwrap();

    let task = h
        .orchestrator
        .patch_task("t1", &RenderTaskPatch::default())
        .await
        .unwrap();
    assert_eq!(task.status, RenderTaskStatus::Initialized);

    assert!(matches!(
        h.orchestrator
            .patch_tasks_by_draft("d1", &RenderTaskPatch::default())
            .await,
        Err(AppError::NoValidFields)
    ));
    assert!(matches!(
        h.orchestrator
            .patch_task("missing", &RenderTaskPatch::default())
            .await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_patch_task_rules() {
    let h = harness();
    h.orchestrator
        .create_task("t1", "d1", Map::new())
        .await
        .unwrap();

    let patch: RenderTaskPatch = serde_json::from_value(json!({
        "status": "processing",
        "progress": 35,
        "extra": {"worker": "render-3"},
        "task_id": "ignored"
    }))
    .unwrap();
    let task = h.orchestrator.patch_task("t1", &patch).await.unwrap();
    assert_eq!(task.task_id, "t1");
    assert_eq!(task.status, RenderTaskStatus::Processing);
    assert_eq!(task.progress, Some(35));
    assert_eq!(task.extra["worker"], "render-3");

    let bad_progress = RenderTaskPatch {
        progress: Some(150),
        ..Default::default()
    };
    assert!(matches!(
        h.orchestrator.patch_task("t1", &bad_progress).await,
        Err(AppError::InvalidRequest(_))
    ));

    h.orchestrator
        .patch_task("t1", &RenderTaskPatch::status(RenderTaskStatus::Failed))
        .await
        .unwrap();
    assert!(matches!(
        h.orchestrator
            .patch_task("t1", &RenderTaskPatch::status(RenderTaskStatus::Processing))
            .await,
        Err(AppError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_bulk_patch_by_draft() {
    let h = harness();
    for task_id in ["t1", "t2"] {
        h.orchestrator
            .create_task(task_id, "d1", Map::new())
            .await
            .unwrap();
    }
    h.orchestrator
        .create_task("t3", "d2", Map::new())
        .await
        .unwrap();
    h.orchestrator
        .patch_task("t1", &RenderTaskPatch::status(RenderTaskStatus::Completed))
        .await
        .unwrap();

    let patch = RenderTaskPatch {
        status: Some(RenderTaskStatus::Processing),
        draft_url: Some("https://drafts.example.com/d1".to_string()),
        ..Default::default()
    };
    let outcome = h
        .orchestrator
        .patch_tasks_by_draft("d1", &patch)
        .await
        .unwrap();
    assert_eq!(outcome.updated, 2);
    assert_eq!(outcome.draft_id, "d1");

    let t1 = h.orchestrator.get_task("t1").await.unwrap();
    assert_eq!(t1.status, RenderTaskStatus::Completed);
    assert_eq!(t1.draft_url.as_deref(), Some("https://drafts.example.com/d1"));
    let t2 = h.orchestrator.get_task("t2").await.unwrap();
    assert_eq!(t2.status, RenderTaskStatus::Processing);
    let t3 = h.orchestrator.get_task("t3").await.unwrap();
    assert_eq!(t3.draft_url, None);

    assert!(matches!(
        h.orchestrator.patch_tasks_by_draft("nope", &patch).await,
        Err(AppError::NotFound(_))
    ));
}
