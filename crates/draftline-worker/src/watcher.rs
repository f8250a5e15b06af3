//! Reconciles finished render jobs into their task rows.

use std::sync::Arc;
use std::time::Duration;

use draftline_core::models::RenderTaskStatus;
use draftline_db::RenderTaskStore;
use tokio::time::{interval, MissedTickBehavior};

use crate::queue::{JobState, JobStatus, RenderQueue};

/// Polls one job until it is ready, then records the outcome.
///
/// A job still running after `watch_timeout` is recorded as failed. The row is
/// only written while it is not terminal yet, so a status a worker already
/// reported through a patch is never overwritten.
#[derive(Clone)]
pub struct StatusWatcher {
    queue: Arc<dyn RenderQueue>,
    tasks: Arc<dyn RenderTaskStore>,
    poll_interval: Duration,
    watch_timeout: Duration,
}

impl StatusWatcher {
    pub fn new(
        queue: Arc<dyn RenderQueue>,
        tasks: Arc<dyn RenderTaskStore>,
        poll_interval: Duration,
        watch_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            tasks,
            poll_interval,
            watch_timeout,
        }
    }

    #[tracing::instrument(skip(self), fields(watch_timeout_secs = self.watch_timeout.as_secs()))]
    pub async fn run(&self, task_id: String) {
        let (status, message) =
            match tokio::time::timeout(self.watch_timeout, self.wait_until_ready(&task_id)).await {
                Ok(job) => outcome(&job),
                Err(_) => {
                    tracing::warn!("Render did not finish before the watch timeout");
                    (
                        RenderTaskStatus::Failed,
                        Some(format!(
                            "Render did not finish within {} seconds",
                            self.watch_timeout.as_secs()
                        )),
                    )
                }
            };

        match self.tasks.finish(&task_id, status, message).await {
            Ok(true) => tracing::info!(status = %status, "Render task finished"),
            Ok(false) => {
                tracing::debug!("Render task was already finished, keeping its status")
            }
            Err(e) => tracing::error!(error = %e, "Failed to record render outcome"),
        }
    }

    async fn wait_until_ready(&self, task_id: &str) -> JobStatus {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.queue.job_status(task_id).await {
                Ok(job) if job.state.is_ready() => return job,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll render job, retrying");
                }
            }
        }
    }
}

fn outcome(job: &JobStatus) -> (RenderTaskStatus, Option<String>) {
    match job.state {
        JobState::Success => (RenderTaskStatus::Completed, None),
        _ => (RenderTaskStatus::Failed, job.failure_message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_maps_ready_states() {
        let success = JobStatus {
            state: JobState::Success,
            result: Some(json!("/renders/out.mp4")),
        };
        assert_eq!(outcome(&success), (RenderTaskStatus::Completed, None));

        let revoked = JobStatus {
            state: JobState::Revoked,
            result: None,
        };
        assert_eq!(outcome(&revoked), (RenderTaskStatus::Failed, None));

        let failed = JobStatus {
            state: JobState::Failure,
            result: Some(json!("encode error")),
        };
        assert_eq!(
            outcome(&failed),
            (RenderTaskStatus::Failed, Some("encode error".to_string()))
        );
    }
}
