//! Client side of the external render queue.
//!
//! Renders run as a chain of jobs on a Celery worker pool. This module only
//! submits chains and reads job states; it never executes a job itself.

mod celery;
mod memory;

pub use celery::CeleryRedisQueue;
pub use memory::{InMemoryRenderQueue, SubmittedChain};

use std::time::Duration;

use draftline_core::AppError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// First stage: fetches the assets a draft references.
pub const PROCESS_DRAFT_TASK: &str = "s3_asset_downloader.tasks.process_draft_content";
/// Final stage: encodes the video.
pub const GENERATE_VIDEO_TASK: &str = "s3_asset_downloader.tasks.generate_video";

/// One job of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSignature {
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Fixed job id. A fresh one is generated at submission when absent.
    pub task_id: Option<String>,
}

impl JobSignature {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            task_id: None,
        }
    }

    pub fn kwarg(mut self, key: &str, value: Value) -> Self {
        self.kwargs.insert(key.to_string(), value);
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Jobs run in order; each receives the result of the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobChain {
    pub queue: String,
    pub stages: Vec<JobSignature>,
}

impl JobChain {
    pub fn new(queue: impl Into<String>, stages: Vec<JobSignature>) -> Self {
        Self {
            queue: queue.into(),
            stages,
        }
    }

    /// Job ids for every stage, generating the missing ones.
    pub(crate) fn resolve_ids(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|stage| {
                stage
                    .task_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainHandle {
    /// Job ids in stage order.
    pub stage_ids: Vec<String>,
}

impl ChainHandle {
    pub fn first(&self) -> Option<&str> {
        self.stage_ids.first().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.stage_ids.last().map(String::as_str)
    }
}

/// Celery job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Received,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl JobState {
    /// Parses a state name as stored by the result backend. Custom progress
    /// states reported by workers count as `Started`.
    pub fn from_celery(state: &str) -> Self {
        match state {
            "PENDING" => JobState::Pending,
            "RECEIVED" => JobState::Received,
            "STARTED" => JobState::Started,
            "RETRY" => JobState::Retry,
            "SUCCESS" => JobState::Success,
            "FAILURE" => JobState::Failure,
            "REVOKED" => JobState::Revoked,
            _ => JobState::Started,
        }
    }

    /// The job will not change state anymore.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Revoked
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub result: Option<Value>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            state: JobState::Pending,
            result: None,
        }
    }

    /// Human readable failure reason taken from the job result.
    pub fn failure_message(&self) -> Option<String> {
        let result = self.result.as_ref()?;
        let message = match result {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("exc_message") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .map(|part| match part {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
                Some(other) => other.to_string(),
                None => result.to_string(),
            },
            other => other.to_string(),
        };
        Some(message)
    }

    /// `unique_dir_name` reported by a finished first stage.
    pub fn unique_dir_name(&self) -> Option<String> {
        if self.state != JobState::Success {
            return None;
        }
        self.result
            .as_ref()?
            .get("unique_dir_name")?
            .as_str()
            .map(str::to_string)
    }
}

#[async_trait::async_trait]
pub trait RenderQueue: Send + Sync {
    /// Best-effort liveness probe, bounded by `timeout`.
    async fn ping(&self, timeout: Duration) -> Result<bool, AppError>;

    async fn submit_chain(&self, chain: &JobChain) -> Result<ChainHandle, AppError>;

    /// State of one job. Unknown ids are `Pending`.
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_states_are_not_ready() {
        assert_eq!(JobState::from_celery("PROGRESS"), JobState::Started);
        assert!(!JobState::from_celery("PROGRESS").is_ready());
        assert!(JobState::from_celery("REVOKED").is_ready());
    }

    #[test]
    fn failure_message_reads_celery_exception() {
        let status = JobStatus {
            state: JobState::Failure,
            result: Some(json!({
                "exc_type": "RuntimeError",
                "exc_message": ["encode error"],
                "exc_module": "builtins"
            })),
        };
        assert_eq!(status.failure_message().as_deref(), Some("encode error"));

        let plain = JobStatus {
            state: JobState::Failure,
            result: Some(json!("disk full")),
        };
        assert_eq!(plain.failure_message().as_deref(), Some("disk full"));
    }

    #[test]
    fn unique_dir_name_needs_success() {
        let result = Some(json!({"unique_dir_name": "render_42"}));
        let done = JobStatus {
            state: JobState::Success,
            result: result.clone(),
        };
        assert_eq!(done.unique_dir_name().as_deref(), Some("render_42"));

        let running = JobStatus {
            state: JobState::Started,
            result,
        };
        assert_eq!(running.unique_dir_name(), None);
    }

    #[test]
    fn missing_stage_ids_are_generated() {
        let chain = JobChain::new(
            "default",
            vec![
                JobSignature::new(PROCESS_DRAFT_TASK),
                JobSignature::new(GENERATE_VIDEO_TASK).with_task_id("final"),
            ],
        );
        let ids = chain.resolve_ids();
        assert_eq!(ids.len(), 2);
        assert!(!ids[0].is_empty());
        assert_eq!(ids[1], "final");
    }
}
