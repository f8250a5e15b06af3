//! In-process implementations of [`DraftBackend`] and [`RenderTaskStore`].
//!
//! Nothing here survives a restart. They back single-process development runs
//! and the test suites.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use draftline_core::models::{
    BackendStats, DraftMetadata, DraftSnapshot, NewRenderTask, RenderTask, RenderTaskPatch,
    RenderTaskStatus, TransitionPolicy,
};
use draftline_core::AppError;

use super::draft::DraftBackend;
use super::render_task::RenderTaskStore;

fn poisoned() -> AppError {
    AppError::Internal("in-memory store lock poisoned".to_string())
}

struct StoredDraft {
    data: Vec<u8>,
    metadata: DraftMetadata,
    is_deleted: bool,
    // Write order, breaks `updated_at` ties in `list`
    seq: u64,
}

impl StoredDraft {
    fn last_used(&self) -> DateTime<Utc> {
        self.metadata
            .accessed_at
            .unwrap_or(self.metadata.updated_at)
    }
}

#[derive(Default)]
struct DraftTable {
    drafts: HashMap<String, StoredDraft>,
    next_seq: u64,
}

/// Draft backend kept in a `HashMap`. With a TTL, `cleanup_expired` drops
/// drafts not read or written within it.
#[derive(Default)]
pub struct MemoryDraftBackend {
    table: Mutex<DraftTable>,
    ttl: Option<Duration>,
}

impl MemoryDraftBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            table: Mutex::default(),
            ttl: Some(ttl),
        }
    }

    /// Ages a stored draft, as if it was last used `age` ago.
    pub fn backdate(&self, draft_id: &str, age: Duration) -> bool {
        let Ok(mut table) = self.table.lock() else {
            return false;
        };
        match table.drafts.get_mut(draft_id) {
            Some(stored) => {
                let then = Utc::now() - age;
                stored.metadata.updated_at = then;
                stored.metadata.accessed_at = Some(then);
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl DraftBackend for MemoryDraftBackend {
    async fn upsert(&self, snapshot: &DraftSnapshot) -> Result<(), AppError> {
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        let now = Utc::now();
        let seq = table.next_seq;
        table.next_seq += 1;

        let mut metadata = DraftMetadata::from_snapshot(snapshot, now);
        if let Some(existing) = table.drafts.get(&snapshot.draft_id) {
            metadata.created_at = existing.metadata.created_at;
            metadata.name = metadata.name.or_else(|| existing.metadata.name.clone());
            metadata.origin = metadata.origin.or(existing.metadata.origin);
        }

        table.drafts.insert(
            snapshot.draft_id.clone(),
            StoredDraft {
                data: snapshot.data.clone(),
                metadata,
                is_deleted: false,
                seq,
            },
        );
        Ok(())
    }

    async fn get(&self, draft_id: &str) -> Result<Option<Vec<u8>>, AppError> {
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table
            .drafts
            .get_mut(draft_id)
            .filter(|stored| !stored.is_deleted)
            .map(|stored| {
                stored.metadata.accessed_at = Some(Utc::now());
                stored.data.clone()
            }))
    }

    async fn exists(&self, draft_id: &str) -> Result<bool, AppError> {
        let table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table
            .drafts
            .get(draft_id)
            .is_some_and(|stored| !stored.is_deleted))
    }

    async fn delete(&self, draft_id: &str) -> Result<bool, AppError> {
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table.drafts.remove(draft_id).is_some())
    }

    async fn soft_delete(&self, draft_id: &str) -> Result<bool, AppError> {
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        match table.drafts.get_mut(draft_id) {
            Some(stored) if !stored.is_deleted => {
                stored.is_deleted = true;
                stored.metadata.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_metadata(&self, draft_id: &str) -> Result<Option<DraftMetadata>, AppError> {
        let table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table
            .drafts
            .get(draft_id)
            .filter(|stored| !stored.is_deleted)
            .map(|stored| stored.metadata.clone()))
    }

    async fn list(&self, limit: i64) -> Result<Vec<DraftMetadata>, AppError> {
        let table = self.table.lock().map_err(|_| poisoned())?;
        let mut live: Vec<&StoredDraft> = table
            .drafts
            .values()
            .filter(|stored| !stored.is_deleted)
            .collect();
        live.sort_by(|a, b| {
            b.metadata
                .updated_at
                .cmp(&a.metadata.updated_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(live
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|stored| stored.metadata.clone())
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<Vec<String>, AppError> {
        let Some(ttl) = self.ttl else {
            return Ok(Vec::new());
        };
        let cutoff = Utc::now() - ttl;
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        let expired: Vec<String> = table
            .drafts
            .iter()
            .filter(|(_, stored)| stored.last_used() < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            table.drafts.remove(id);
        }
        Ok(expired)
    }

    async fn stats(&self) -> Result<BackendStats, AppError> {
        let table = self.table.lock().map_err(|_| poisoned())?;
        Ok(BackendStats {
            total_drafts: table.drafts.values().filter(|s| !s.is_deleted).count() as i64,
            backend: "memory".to_string(),
        })
    }
}

/// Render task store kept in a `HashMap`.
#[derive(Default)]
pub struct MemoryRenderTaskStore {
    tasks: Mutex<HashMap<String, RenderTask>>,
}

impl MemoryRenderTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl RenderTaskStore for MemoryRenderTaskStore {
    async fn create_if_absent(&self, task: NewRenderTask) -> Result<RenderTask, AppError> {
        let mut tasks = self.tasks.lock().map_err(|_| poisoned())?;
        let stored = tasks
            .entry(task.task_id.clone())
            .or_insert_with(|| RenderTask::new(task));
        Ok(stored.clone())
    }

    async fn upsert_initialized(&self, task: NewRenderTask) -> Result<RenderTask, AppError> {
        let mut tasks = self.tasks.lock().map_err(|_| poisoned())?;
        match tasks.get_mut(&task.task_id) {
            Some(existing) => {
                if task.video_name.is_some() {
                    existing.video_name = task.video_name;
                }
                existing.updated_at = Utc::now();
                Ok(existing.clone())
            }
            None => {
                let created = RenderTask::new(task);
                tasks.insert(created.task_id.clone(), created.clone());
                Ok(created)
            }
        }
    }

    async fn get(&self, task_id: &str) -> Result<Option<RenderTask>, AppError> {
        let tasks = self.tasks.lock().map_err(|_| poisoned())?;
        Ok(tasks.get(task_id).cloned())
    }

    async fn patch(
        &self,
        task_id: &str,
        patch: &RenderTaskPatch,
    ) -> Result<Option<RenderTask>, AppError> {
        let mut tasks = self.tasks.lock().map_err(|_| poisoned())?;
        let Some(stored) = tasks.get_mut(task_id) else {
            return Ok(None);
        };
        // Patch a copy so a rejected change leaves the row untouched
        let mut task = stored.clone();
        task.apply_patch(patch, TransitionPolicy::Reject)?;
        *stored = task.clone();
        Ok(Some(task))
    }

    async fn patch_by_draft(
        &self,
        draft_id: &str,
        patch: &RenderTaskPatch,
    ) -> Result<Vec<String>, AppError> {
        patch.validate()?;
        let mut tasks = self.tasks.lock().map_err(|_| poisoned())?;
        let mut matched: Vec<&mut RenderTask> = tasks
            .values_mut()
            .filter(|task| task.draft_id == draft_id)
            .collect();
        matched.sort_by_key(|task| task.created_at);

        let mut task_ids = Vec::with_capacity(matched.len());
        for task in matched {
            task.apply_patch(patch, TransitionPolicy::KeepStatus)?;
            task_ids.push(task.task_id.clone());
        }
        Ok(task_ids)
    }

    async fn finish(
        &self,
        task_id: &str,
        status: RenderTaskStatus,
        message: Option<String>,
    ) -> Result<bool, AppError> {
        let mut tasks = self.tasks.lock().map_err(|_| poisoned())?;
        Ok(tasks
            .get_mut(task_id)
            .is_some_and(|task| task.finish(status, message)))
    }

    async fn list_for_draft(&self, draft_id: &str) -> Result<Vec<RenderTask>, AppError> {
        let tasks = self.tasks.lock().map_err(|_| poisoned())?;
        let mut matched: Vec<RenderTask> = tasks
            .values()
            .filter(|task| task.draft_id == draft_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }
}
