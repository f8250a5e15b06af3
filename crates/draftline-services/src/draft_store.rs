//! Two-tier draft store.
//!
//! A bounded LRU of decoded documents sits in front of a [`DraftBackend`].
//! Saves write through to the backend first and always land in the cache,
//! so a backend outage degrades to memory-only operation instead of failing
//! the caller. The cache lock is never held across an `.await`.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use draftline_core::models::{
    BackendStats, DraftDocument, DraftMetadata, DraftOrigin, DraftSearch, DraftSearchResult,
    DraftSnapshot,
};
use draftline_core::AppError;
use draftline_db::DraftBackend;
use lru::LruCache;
use serde::Serialize;

/// Number of drafts `search` scans before filtering.
pub const SEARCH_SCAN_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    /// False when only the cache took the write.
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RemoveOutcome {
    pub removed_from_cache: bool,
    pub removed_from_store: bool,
}

impl RemoveOutcome {
    pub fn removed(&self) -> bool {
        self.removed_from_cache || self.removed_from_store
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftStoreStats {
    pub cache_size: usize,
    pub cache_capacity: usize,
    /// `None` when the backend could not be reached.
    pub backend: Option<BackendStats>,
}

pub struct DraftStore {
    backend: Arc<dyn DraftBackend>,
    cache: Mutex<DraftCache>,
}

/// LRU entries plus a counter bumped by every write to the cache.
///
/// A miss records the epoch before reading the backend; the loaded document
/// is only promoted if no save, removal or expiry happened in between.
struct DraftCache {
    entries: LruCache<String, DraftDocument>,
    epoch: u64,
}

impl DraftCache {
    fn store(&mut self, draft_id: &str, document: DraftDocument) {
        self.epoch = self.epoch.wrapping_add(1);
        self.entries.put(draft_id.to_string(), document);
    }

    fn invalidate(&mut self, draft_id: &str) -> bool {
        self.epoch = self.epoch.wrapping_add(1);
        self.entries.pop(draft_id).is_some()
    }

    /// Returns the document callers should see after a backend load.
    fn promote(&mut self, draft_id: &str, loaded: DraftDocument, seen_epoch: u64) -> DraftDocument {
        if let Some(cached) = self.entries.get(draft_id) {
            return cached.clone();
        }
        if self.epoch == seen_epoch {
            self.entries.put(draft_id.to_string(), loaded.clone());
        } else {
            tracing::debug!(draft_id, "Draft changed during backend load, not caching it");
        }
        loaded
    }
}

/// Backend failures surface to callers as `BackendUnavailable`.
fn unavailable(err: AppError) -> AppError {
    if err.is_backend_unavailable() {
        AppError::BackendUnavailable(err.to_string())
    } else {
        err
    }
}

impl DraftStore {
    pub fn new(backend: Arc<dyn DraftBackend>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            cache: Mutex::new(DraftCache {
                entries: LruCache::new(capacity),
                epoch: 0,
            }),
        }
    }

    fn cache(&self, op: &'static str) -> MutexGuard<'_, DraftCache> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(op, "Recovered from poisoned draft cache lock");
                poisoned.into_inner()
            }
        }
    }

    pub async fn save(
        &self,
        draft_id: &str,
        document: &DraftDocument,
    ) -> Result<SaveOutcome, AppError> {
        self.save_with_origin(draft_id, document, None).await
    }

    /// Writes through to the backend, then caches the document. A backend
    /// failure is logged and the cache is updated anyway.
    #[tracing::instrument(skip(self, document))]
    pub async fn save_with_origin(
        &self,
        draft_id: &str,
        document: &DraftDocument,
        origin: Option<DraftOrigin>,
    ) -> Result<SaveOutcome, AppError> {
        let snapshot = DraftSnapshot::from_document(draft_id, document, origin)?;

        let persisted = match self.backend.upsert(&snapshot).await {
            Ok(()) => {
                tracing::debug!(size_bytes = snapshot.size_bytes, "Draft persisted");
                true
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to persist draft, keeping it in memory only"
                );
                false
            }
        };

        self.cache("save").store(draft_id, document.clone());

        Ok(SaveOutcome { persisted })
    }

    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, draft_id: &str) -> Result<DraftDocument, AppError> {
        let seen_epoch = {
            let mut cache = self.cache("fetch");
            if let Some(document) = cache.entries.get(draft_id) {
                return Ok(document.clone());
            }
            cache.epoch
        };

        let data = self
            .backend
            .get(draft_id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| AppError::NotFound(format!("Draft {} not found", draft_id)))?;

        let loaded = DraftDocument::from_bytes(&data)?;
        let document = self
            .cache("fetch.promote")
            .promote(draft_id, loaded, seen_epoch);
        tracing::debug!("Draft loaded from backend");

        Ok(document)
    }

    /// Checks the cache, then the backend. Does not change recency.
    pub async fn exists(&self, draft_id: &str) -> Result<bool, AppError> {
        if self.cache("exists").entries.contains(draft_id) {
            return Ok(true);
        }
        self.backend.exists(draft_id).await.map_err(unavailable)
    }

    /// Hard-deletes the draft from both tiers independently.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, draft_id: &str) -> Result<RemoveOutcome, AppError> {
        let mut removed_from_cache = self.cache("remove").invalidate(draft_id);

        let deleted = self.backend.delete(draft_id).await;
        // A fetch that read the row before the delete may have promoted it
        removed_from_cache |= self.cache("remove").invalidate(draft_id);

        let removed_from_store = match deleted {
            Ok(removed) => removed,
            Err(e) if removed_from_cache => {
                tracing::error!(error = %e, "Failed to delete draft from backend");
                false
            }
            Err(e) => return Err(unavailable(e)),
        };

        Ok(RemoveOutcome {
            removed_from_cache,
            removed_from_store,
        })
    }

    /// Flags the draft deleted in the backend and drops the cached copy.
    #[tracing::instrument(skip(self))]
    pub async fn soft_delete(&self, draft_id: &str) -> Result<bool, AppError> {
        let flagged = self
            .backend
            .soft_delete(draft_id)
            .await
            .map_err(unavailable)?;
        let evicted = self.cache("soft_delete").invalidate(draft_id);
        Ok(flagged || evicted)
    }

    pub async fn get_metadata(&self, draft_id: &str) -> Result<DraftMetadata, AppError> {
        self.backend
            .get_metadata(draft_id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| AppError::NotFound(format!("Draft {} not found", draft_id)))
    }

    /// Most recently updated first, straight from the backend.
    pub async fn list(&self, limit: usize) -> Result<Vec<DraftMetadata>, AppError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.backend.list(limit).await.map_err(unavailable)
    }

    pub async fn search(&self, search: &DraftSearch) -> Result<DraftSearchResult, AppError> {
        let scanned = self.list(SEARCH_SCAN_LIMIT).await?;
        let total_drafts = scanned.len();
        let drafts = scanned
            .into_iter()
            .filter(|draft| search.matches(draft))
            .collect();
        Ok(DraftSearchResult {
            drafts,
            total_drafts,
        })
    }

    /// Lets the backend expire old drafts and drops them from the cache too.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_expired(&self) -> Result<usize, AppError> {
        let removed = self
            .backend
            .cleanup_expired()
            .await
            .map_err(unavailable)?;

        let mut cache = self.cache("cleanup_expired");
        for draft_id in &removed {
            cache.invalidate(draft_id);
        }
        Ok(removed.len())
    }

    pub async fn stats(&self) -> DraftStoreStats {
        let (cache_size, cache_capacity) = {
            let cache = self.cache("stats");
            (cache.entries.len(), cache.entries.cap().get())
        };

        let backend = match self.backend.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read draft backend stats");
                None
            }
        };

        DraftStoreStats {
            cache_size,
            cache_capacity,
            backend,
        }
    }

    /// Whether the draft is currently held in the cache. Does not change recency.
    pub fn is_cached(&self, draft_id: &str) -> bool {
        self.cache("is_cached").entries.contains(draft_id)
    }
}
