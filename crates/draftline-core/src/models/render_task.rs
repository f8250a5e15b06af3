use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RenderTaskStatus {
    Initialized,
    Processing,
    Completed,
    Failed,
}

impl Display for RenderTaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderTaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(RenderTaskStatus::Initialized),
            "processing" => Ok(RenderTaskStatus::Processing),
            "completed" => Ok(RenderTaskStatus::Completed),
            "failed" => Ok(RenderTaskStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid render task status: {}", s)),
        }
    }
}

impl RenderTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderTaskStatus::Initialized => "initialized",
            RenderTaskStatus::Processing => "processing",
            RenderTaskStatus::Completed => "completed",
            RenderTaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RenderTaskStatus::Completed | RenderTaskStatus::Failed)
    }

    /// Status only moves forward; a terminal status is final.
    pub fn can_transition_to(&self, next: RenderTaskStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            RenderTaskStatus::Initialized => true,
            RenderTaskStatus::Processing => next.is_terminal(),
            RenderTaskStatus::Completed | RenderTaskStatus::Failed => false,
        }
    }
}

/// How a patch treats a status change the current status does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPolicy {
    /// Fail the whole patch with `InvalidRequest`.
    Reject,
    /// Leave the status as is and apply the other fields.
    KeepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderTask {
    pub task_id: String,
    pub draft_id: String,
    pub status: RenderTaskStatus,
    pub progress: Option<i32>,
    pub message: Option<String>,
    pub draft_url: Option<String>,
    pub video_name: Option<String>,
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for RenderTask {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let extra = match row.try_get::<Option<Value>, _>("extra")? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Ok(RenderTask {
            task_id: row.try_get("task_id")?,
            draft_id: row.try_get("draft_id")?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse status: {}", e).into())
            })?,
            progress: row.try_get("progress")?,
            message: row.try_get("message")?,
            draft_url: row.try_get("draft_url")?,
            video_name: row.try_get("video_name")?,
            extra,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl RenderTask {
    pub fn new(new_task: NewRenderTask) -> Self {
        let now = Utc::now();
        Self {
            task_id: new_task.task_id,
            draft_id: new_task.draft_id,
            status: RenderTaskStatus::Initialized,
            progress: None,
            message: None,
            draft_url: None,
            video_name: new_task.video_name,
            extra: new_task.extra,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies every present field of `patch`. Returns whether anything was
    /// written; `updated_at` is bumped only then.
    pub fn apply_patch(
        &mut self,
        patch: &RenderTaskPatch,
        policy: TransitionPolicy,
    ) -> Result<bool, AppError> {
        patch.validate()?;

        let mut changed = false;
        if let Some(status) = patch.status {
            if self.status.can_transition_to(status) {
                changed |= self.status != status;
                self.status = status;
            } else if policy == TransitionPolicy::Reject {
                return Err(AppError::InvalidRequest(format!(
                    "Task {} cannot move from {} to {}",
                    self.task_id, self.status, status
                )));
            }
        }
        if let Some(progress) = patch.progress {
            self.progress = Some(progress);
            changed = true;
        }
        if let Some(message) = &patch.message {
            self.message = Some(message.clone());
            changed = true;
        }
        if let Some(draft_url) = &patch.draft_url {
            self.draft_url = Some(draft_url.clone());
            changed = true;
        }
        if let Some(extra) = &patch.extra {
            for (key, value) in extra {
                self.extra.insert(key.clone(), value.clone());
            }
            changed = true;
        }

        if changed {
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }

    /// Moves a non-terminal task to `status`. A task that already finished is
    /// left untouched and `false` is returned.
    pub fn finish(&mut self, status: RenderTaskStatus, message: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if message.is_some() {
            self.message = message;
        }
        self.updated_at = Utc::now();
        true
    }
}

#[derive(Debug, Clone)]
pub struct NewRenderTask {
    pub task_id: String,
    pub draft_id: String,
    pub video_name: Option<String>,
    pub extra: Map<String, Value>,
}

impl NewRenderTask {
    pub fn new(task_id: impl Into<String>, draft_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            draft_id: draft_id.into(),
            video_name: None,
            extra: Map::new(),
        }
    }

    pub fn with_video_name(mut self, video_name: Option<String>) -> Self {
        self.video_name = video_name;
        self
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }
}

/// Partial update of a render task. Only these fields can be patched; any
/// other key in incoming JSON is ignored on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderTaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RenderTaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_url: Option<String>,
    /// Merged key by key into the stored map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

impl RenderTaskPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.message.is_none()
            && self.draft_url.is_none()
            && self.extra.is_none()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(progress) = self.progress {
            if !(0..=100).contains(&progress) {
                return Err(AppError::InvalidRequest(format!(
                    "progress must be between 0 and 100, got {}",
                    progress
                )));
            }
        }
        Ok(())
    }

    pub fn status(status: RenderTaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(status: RenderTaskStatus) -> RenderTask {
        let mut task = RenderTask::new(NewRenderTask::new("t1", "d1"));
        task.status = status;
        task
    }

    #[test]
    fn terminal_status_is_final() {
        use RenderTaskStatus::*;
        assert!(Initialized.can_transition_to(Processing));
        assert!(Initialized.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Initialized));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn patch_ignores_unknown_keys() {
        let patch: RenderTaskPatch =
            serde_json::from_value(json!({"progress": 40, "task_id": "other", "bogus": true}))
                .unwrap();
        assert_eq!(patch.progress, Some(40));
        assert!(!patch.is_empty());

        let unknown_only: RenderTaskPatch =
            serde_json::from_value(json!({"draft_id": "d2"})).unwrap();
        assert!(unknown_only.is_empty());
    }

    #[test]
    fn patch_rejects_out_of_range_progress() {
        let mut task = task(RenderTaskStatus::Processing);
        let patch = RenderTaskPatch {
            progress: Some(101),
            ..Default::default()
        };
        assert!(matches!(
            task.apply_patch(&patch, TransitionPolicy::Reject),
            Err(AppError::InvalidRequest(_))
        ));
        assert_eq!(task.progress, None);
    }

    #[test]
    fn patch_merges_extra_shallowly() {
        let mut task = task(RenderTaskStatus::Initialized);
        task.extra.insert("unique_dir_name".into(), json!("abc"));
        task.extra.insert("attempt".into(), json!(1));

        let patch = RenderTaskPatch {
            extra: Some(json!({"attempt": 2, "worker": "w-1"}).as_object().cloned().unwrap()),
            ..Default::default()
        };
        assert!(task.apply_patch(&patch, TransitionPolicy::Reject).unwrap());
        assert_eq!(task.extra["unique_dir_name"], "abc");
        assert_eq!(task.extra["attempt"], 2);
        assert_eq!(task.extra["worker"], "w-1");
    }

    #[test]
    fn patch_out_of_terminal_depends_on_policy() {
        let patch = RenderTaskPatch {
            status: Some(RenderTaskStatus::Processing),
            message: Some("late update".into()),
            ..Default::default()
        };

        let mut rejected = task(RenderTaskStatus::Completed);
        assert!(rejected
            .apply_patch(&patch, TransitionPolicy::Reject)
            .is_err());
        assert_eq!(rejected.message, None);

        let mut kept = task(RenderTaskStatus::Completed);
        assert!(kept.apply_patch(&patch, TransitionPolicy::KeepStatus).unwrap());
        assert_eq!(kept.status, RenderTaskStatus::Completed);
        assert_eq!(kept.message.as_deref(), Some("late update"));
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let mut task = task(RenderTaskStatus::Processing);
        let before = task.clone();
        assert!(!task
            .apply_patch(&RenderTaskPatch::default(), TransitionPolicy::Reject)
            .unwrap());
        assert_eq!(task, before);
    }

    #[test]
    fn finish_only_moves_open_tasks() {
        let mut open = task(RenderTaskStatus::Processing);
        assert!(open.finish(RenderTaskStatus::Failed, Some("encode error".into())));
        assert_eq!(open.status, RenderTaskStatus::Failed);
        assert_eq!(open.message.as_deref(), Some("encode error"));

        let mut done = task(RenderTaskStatus::Completed);
        assert!(!done.finish(RenderTaskStatus::Failed, Some("timeout".into())));
        assert_eq!(done.status, RenderTaskStatus::Completed);
        assert_eq!(done.message, None);
    }
}
