use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use draftline_core::AppError;
use serde_json::Value;

use super::{ChainHandle, JobChain, JobState, JobStatus, RenderQueue};

/// A chain accepted by [`InMemoryRenderQueue`].
#[derive(Debug, Clone)]
pub struct SubmittedChain {
    pub chain: JobChain,
    pub handle: ChainHandle,
}

#[derive(Default)]
struct QueueState {
    submitted: Vec<SubmittedChain>,
    statuses: HashMap<String, JobStatus>,
    offline: bool,
    workers_idle: bool,
    first_stage_result: Option<Value>,
}

/// Render queue that only records what it is given. Jobs stay `PENDING`
/// until a caller completes, fails or otherwise moves them.
#[derive(Default)]
pub struct InMemoryRenderQueue {
    state: Mutex<QueueState>,
}

impl InMemoryRenderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn submissions(&self) -> Vec<SubmittedChain> {
        self.state().submitted.clone()
    }

    pub fn set_status(&self, job_id: &str, status: JobStatus) {
        self.state().statuses.insert(job_id.to_string(), status);
    }

    pub fn complete(&self, job_id: &str, result: Value) {
        self.set_status(
            job_id,
            JobStatus {
                state: JobState::Success,
                result: Some(result),
            },
        );
    }

    pub fn fail(&self, job_id: &str, message: &str) {
        self.set_status(
            job_id,
            JobStatus {
                state: JobState::Failure,
                result: Some(Value::String(message.to_string())),
            },
        );
    }

    /// While offline every call fails as if the broker were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Marks the first stage of every later submission as already succeeded
    /// with `result`, like a worker that picked it up immediately.
    pub fn set_first_stage_result(&self, result: Option<Value>) {
        self.state().first_stage_result = result;
    }

    /// Makes `ping` report that no worker answered.
    pub fn set_workers_idle(&self, idle: bool) {
        self.state().workers_idle = idle;
    }
}

fn offline_error() -> AppError {
    AppError::BackendUnavailable("render queue is offline".to_string())
}

#[async_trait::async_trait]
impl RenderQueue for InMemoryRenderQueue {
    async fn ping(&self, _timeout: Duration) -> Result<bool, AppError> {
        let state = self.state();
        if state.offline {
            return Err(offline_error());
        }
        Ok(!state.workers_idle)
    }

    async fn submit_chain(&self, chain: &JobChain) -> Result<ChainHandle, AppError> {
        let mut state = self.state();
        if state.offline {
            return Err(offline_error());
        }
        let handle = ChainHandle {
            stage_ids: chain.resolve_ids(),
        };
        if let (Some(result), Some(first)) = (state.first_stage_result.clone(), handle.first()) {
            state.statuses.insert(
                first.to_string(),
                JobStatus {
                    state: JobState::Success,
                    result: Some(result),
                },
            );
        }
        state.submitted.push(SubmittedChain {
            chain: chain.clone(),
            handle: handle.clone(),
        });
        Ok(handle)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, AppError> {
        let state = self.state();
        if state.offline {
            return Err(offline_error());
        }
        Ok(state
            .statuses
            .get(job_id)
            .cloned()
            .unwrap_or_else(JobStatus::pending))
    }
}
