use draftline_core::models::{BackendStats, DraftMetadata, DraftSnapshot};
use draftline_core::AppError;
use sqlx::{PgPool, Postgres, Row};

/// Durable tier of the draft store.
///
/// Soft-deleted rows are invisible to every read here; only `delete` and
/// `cleanup_expired` still reach them.
#[async_trait::async_trait]
pub trait DraftBackend: Send + Sync {
    /// Insert or fully replace the draft in one statement.
    async fn upsert(&self, snapshot: &DraftSnapshot) -> Result<(), AppError>;

    /// Payload of a live draft. Touches `accessed_at`.
    async fn get(&self, draft_id: &str) -> Result<Option<Vec<u8>>, AppError>;

    async fn exists(&self, draft_id: &str) -> Result<bool, AppError>;

    /// Hard delete. Returns whether a row was removed.
    async fn delete(&self, draft_id: &str) -> Result<bool, AppError>;

    async fn soft_delete(&self, draft_id: &str) -> Result<bool, AppError>;

    async fn get_metadata(&self, draft_id: &str) -> Result<Option<DraftMetadata>, AppError>;

    /// Most recently updated first.
    async fn list(&self, limit: i64) -> Result<Vec<DraftMetadata>, AppError>;

    /// Removes expired drafts and returns their ids.
    async fn cleanup_expired(&self) -> Result<Vec<String>, AppError>;

    async fn stats(&self) -> Result<BackendStats, AppError>;
}

const METADATA_COLUMNS: &str = r#"
    draft_id, width, height, duration, fps, version, size_bytes,
    draft_name, resource, created_at, updated_at, accessed_at
"#;

#[derive(Clone)]
pub struct PostgresDraftRepository {
    pool: PgPool,
    retention_days: i32,
}

impl PostgresDraftRepository {
    /// `retention_days == 0` disables `cleanup_expired`.
    pub fn new(pool: PgPool, retention_days: i32) -> Self {
        Self {
            pool,
            retention_days,
        }
    }
}

#[async_trait::async_trait]
impl DraftBackend for PostgresDraftRepository {
    #[tracing::instrument(skip(self, snapshot), fields(
        db.system = "postgresql",
        db.table = "drafts",
        db.operation = "upsert",
        draft_id = %snapshot.draft_id,
        size_bytes = snapshot.size_bytes
    ))]
    async fn upsert(&self, snapshot: &DraftSnapshot) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO drafts (
                draft_id, data, width, height, duration, fps, version,
                size_bytes, draft_name, resource, is_deleted,
                created_at, updated_at, accessed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, NOW(), NOW(), NOW())
            ON CONFLICT (draft_id) DO UPDATE SET
                data = EXCLUDED.data,
                width = EXCLUDED.width,
                height = EXCLUDED.height,
                duration = EXCLUDED.duration,
                fps = EXCLUDED.fps,
                version = EXCLUDED.version,
                size_bytes = EXCLUDED.size_bytes,
                draft_name = COALESCE(EXCLUDED.draft_name, drafts.draft_name),
                resource = COALESCE(EXCLUDED.resource, drafts.resource),
                is_deleted = FALSE,
                updated_at = NOW(),
                accessed_at = NOW()
            "#,
        )
        .bind(&snapshot.draft_id)
        .bind(&snapshot.data)
        .bind(snapshot.width)
        .bind(snapshot.height)
        .bind(snapshot.duration)
        .bind(snapshot.fps)
        .bind(&snapshot.version)
        .bind(snapshot.size_bytes)
        .bind(&snapshot.name)
        .bind(snapshot.origin)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to upsert draft");
            AppError::Database(e)
        })?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "drafts", db.operation = "select"))]
    async fn get(&self, draft_id: &str) -> Result<Option<Vec<u8>>, AppError> {
        // One statement so the read and the access stamp cannot diverge
        let data: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            UPDATE drafts
            SET accessed_at = NOW()
            WHERE draft_id = $1 AND is_deleted = FALSE
            RETURNING data
            "#,
        )
        .bind(draft_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(data)
    }

    #[tracing::instrument(skip(self))]
    async fn exists(&self, draft_id: &str) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM drafts WHERE draft_id = $1 AND is_deleted = FALSE)",
        )
        .bind(draft_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "drafts", db.operation = "delete"))]
    async fn delete(&self, draft_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM drafts WHERE draft_id = $1")
            .bind(draft_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn soft_delete(&self, draft_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE drafts
            SET is_deleted = TRUE, updated_at = NOW()
            WHERE draft_id = $1 AND is_deleted = FALSE
            "#,
        )
        .bind(draft_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn get_metadata(&self, draft_id: &str) -> Result<Option<DraftMetadata>, AppError> {
        let sql = format!(
            "SELECT {} FROM drafts WHERE draft_id = $1 AND is_deleted = FALSE",
            METADATA_COLUMNS
        );
        let metadata = sqlx::query_as::<Postgres, DraftMetadata>(&sql)
            .bind(draft_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(metadata)
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self, limit: i64) -> Result<Vec<DraftMetadata>, AppError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM drafts
            WHERE is_deleted = FALSE
            ORDER BY updated_at DESC, id DESC
            LIMIT $1
            "#,
            METADATA_COLUMNS
        );
        let drafts = sqlx::query_as::<Postgres, DraftMetadata>(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        Ok(drafts)
    }

    #[tracing::instrument(skip(self), fields(retention_days = self.retention_days))]
    async fn cleanup_expired(&self) -> Result<Vec<String>, AppError> {
        if self.retention_days <= 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            DELETE FROM drafts
            WHERE COALESCE(accessed_at, updated_at) < NOW() - make_interval(days => $1)
            RETURNING draft_id
            "#,
        )
        .bind(self.retention_days)
        .fetch_all(&self.pool)
        .await?;

        let removed: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("draft_id"))
            .collect::<Result<_, _>>()?;

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Removed expired drafts");
        }

        Ok(removed)
    }

    #[tracing::instrument(skip(self))]
    async fn stats(&self) -> Result<BackendStats, AppError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM drafts WHERE is_deleted = FALSE")
                .fetch_one(&self.pool)
                .await?;

        Ok(BackendStats {
            total_drafts: total,
            backend: "postgresql".to_string(),
        })
    }
}
