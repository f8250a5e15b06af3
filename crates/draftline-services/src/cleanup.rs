use std::sync::Arc;
use std::time::Duration;

use draftline_core::AppError;
use tokio::time::interval;

use crate::draft_store::DraftStore;

/// Periodically expires drafts through [`DraftStore::cleanup_expired`].
#[derive(Clone)]
pub struct DraftCleanupService {
    store: Arc<DraftStore>,
    every: Duration,
}

impl DraftCleanupService {
    pub fn new(store: Arc<DraftStore>, every: Duration) -> Self {
        Self { store, every }
    }

    /// Start the background sweep. The first run happens immediately.
    /// Returns a JoinHandle for graceful shutdown
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut cleanup_interval = interval(self.every);

            loop {
                cleanup_interval.tick().await;

                match self.run_once().await {
                    Ok(removed) => {
                        tracing::info!(removed, "Draft cleanup completed");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Draft cleanup failed");
                    }
                }
            }
        })
    }

    #[tracing::instrument(skip(self), fields(cleanup.operation = "expire_drafts"))]
    pub async fn run_once(&self) -> Result<usize, AppError> {
        self.store.cleanup_expired().await
    }
}
