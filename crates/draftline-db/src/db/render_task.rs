use draftline_core::models::{
    NewRenderTask, RenderTask, RenderTaskPatch, RenderTaskStatus, TransitionPolicy,
};
use draftline_core::AppError;
use serde_json::Value;
use sqlx::{PgPool, Postgres};

/// Keeps transaction failures classified as database errors so callers see
/// the store as unavailable rather than an internal fault.
fn transaction_error(stage: &'static str, err: sqlx::Error) -> AppError {
    tracing::error!(error = %err, "{}", stage);
    AppError::Database(err)
}

/// Durable record of every dispatched render.
#[async_trait::async_trait]
pub trait RenderTaskStore: Send + Sync {
    /// Inserts the task unless a row with its id exists; either way returns
    /// the stored row, which for an existing id is left unchanged.
    async fn create_if_absent(&self, task: NewRenderTask) -> Result<RenderTask, AppError>;

    /// Inserts an `initialized` row, or refreshes `video_name` of an existing one.
    async fn upsert_initialized(&self, task: NewRenderTask) -> Result<RenderTask, AppError>;

    async fn get(&self, task_id: &str) -> Result<Option<RenderTask>, AppError>;

    /// Applies the patch to one task. Illegal status changes are rejected.
    async fn patch(
        &self,
        task_id: &str,
        patch: &RenderTaskPatch,
    ) -> Result<Option<RenderTask>, AppError>;

    /// Applies the patch to every task of a draft and returns their ids.
    /// Tasks whose status cannot take the change keep it.
    async fn patch_by_draft(
        &self,
        draft_id: &str,
        patch: &RenderTaskPatch,
    ) -> Result<Vec<String>, AppError>;

    /// Moves a task that has not finished yet into a terminal status.
    async fn finish(
        &self,
        task_id: &str,
        status: RenderTaskStatus,
        message: Option<String>,
    ) -> Result<bool, AppError>;

    /// Newest first.
    async fn list_for_draft(&self, draft_id: &str) -> Result<Vec<RenderTask>, AppError>;
}

const TASK_COLUMNS: &str = r#"
    task_id, draft_id, status, progress, message, draft_url,
    video_name, extra, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PostgresRenderTaskRepository {
    pool: PgPool,
}

impl PostgresRenderTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_back(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        task: &RenderTask,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE render_tasks
            SET status = $2, progress = $3, message = $4, draft_url = $5,
                extra = $6, updated_at = $7
            WHERE task_id = $1
            "#,
        )
        .bind(&task.task_id)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(&task.message)
        .bind(&task.draft_url)
        .bind(Value::Object(task.extra.clone()))
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RenderTaskStore for PostgresRenderTaskRepository {
    #[tracing::instrument(skip(self, task), fields(
        db.system = "postgresql",
        db.table = "render_tasks",
        db.operation = "insert",
        task_id = %task.task_id,
        draft_id = %task.draft_id
    ))]
    async fn create_if_absent(&self, task: NewRenderTask) -> Result<RenderTask, AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO render_tasks (task_id, draft_id, status, video_name, extra)
            VALUES ($1, $2, 'initialized', $3, $4)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.draft_id)
        .bind(&task.video_name)
        .bind(Value::Object(task.extra.clone()))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!("Render task already exists, returning stored row");
        }

        self.get(&task.task_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Task {} vanished after insert", task.task_id)))
    }

    #[tracing::instrument(skip(self, task), fields(
        db.system = "postgresql",
        db.table = "render_tasks",
        db.operation = "upsert",
        task_id = %task.task_id
    ))]
    async fn upsert_initialized(&self, task: NewRenderTask) -> Result<RenderTask, AppError> {
        let sql = format!(
            r#"
            INSERT INTO render_tasks (task_id, draft_id, status, video_name, extra)
            VALUES ($1, $2, 'initialized', $3, $4)
            ON CONFLICT (task_id) DO UPDATE SET
                video_name = COALESCE(EXCLUDED.video_name, render_tasks.video_name),
                updated_at = NOW()
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        let row = sqlx::query_as::<Postgres, RenderTask>(&sql)
            .bind(&task.task_id)
            .bind(&task.draft_id)
            .bind(&task.video_name)
            .bind(Value::Object(task.extra))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to pre-register render task");
                AppError::Database(e)
            })?;

        Ok(row)
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, task_id: &str) -> Result<Option<RenderTask>, AppError> {
        let sql = format!("SELECT {} FROM render_tasks WHERE task_id = $1", TASK_COLUMNS);
        let task = sqlx::query_as::<Postgres, RenderTask>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    #[tracing::instrument(skip(self, patch))]
    async fn patch(
        &self,
        task_id: &str,
        patch: &RenderTaskPatch,
    ) -> Result<Option<RenderTask>, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| transaction_error("Failed to begin transaction for task patch", e))?;

        let sql = format!(
            "SELECT {} FROM render_tasks WHERE task_id = $1 FOR UPDATE",
            TASK_COLUMNS
        );
        let Some(mut task) = sqlx::query_as::<Postgres, RenderTask>(&sql)
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        if task.apply_patch(patch, TransitionPolicy::Reject)? {
            Self::write_back(&mut tx, &task).await?;
        }

        tx.commit()
            .await
            .map_err(|e| transaction_error("Failed to commit task patch", e))?;

        Ok(Some(task))
    }

    #[tracing::instrument(skip(self, patch))]
    async fn patch_by_draft(
        &self,
        draft_id: &str,
        patch: &RenderTaskPatch,
    ) -> Result<Vec<String>, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| transaction_error("Failed to begin transaction for bulk task patch", e))?;

        let sql = format!(
            r#"
            SELECT {}
            FROM render_tasks
            WHERE draft_id = $1
            ORDER BY created_at, id
            FOR UPDATE
            "#,
            TASK_COLUMNS
        );
        let tasks = sqlx::query_as::<Postgres, RenderTask>(&sql)
            .bind(draft_id)
            .fetch_all(&mut *tx)
            .await?;

        let mut task_ids = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            if task.apply_patch(patch, TransitionPolicy::KeepStatus)? {
                Self::write_back(&mut tx, &task).await?;
            }
            task_ids.push(task.task_id);
        }

        tx.commit()
            .await
            .map_err(|e| transaction_error("Failed to commit bulk task patch", e))?;

        tracing::info!(count = task_ids.len(), "Patched render tasks of draft");
        Ok(task_ids)
    }

    #[tracing::instrument(skip(self, message), fields(status = %status))]
    async fn finish(
        &self,
        task_id: &str,
        status: RenderTaskStatus,
        message: Option<String>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE render_tasks
            SET status = $2, message = COALESCE($3, message), updated_at = NOW()
            WHERE task_id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn list_for_draft(&self, draft_id: &str) -> Result<Vec<RenderTask>, AppError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM render_tasks
            WHERE draft_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
            TASK_COLUMNS
        );
        let tasks = sqlx::query_as::<Postgres, RenderTask>(&sql)
            .bind(draft_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_failures_are_backend_unavailable() {
        let err = transaction_error("Failed to commit task patch", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, AppError::Database(_)));
        assert!(err.is_backend_unavailable());
    }
}
