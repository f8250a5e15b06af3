//! Draftline services
//!
//! The two-tier draft store and the background sweep that expires old drafts.

pub mod cleanup;
pub mod draft_store;

pub use cleanup::DraftCleanupService;
pub use draft_store::{DraftStore, DraftStoreStats, RemoveOutcome, SaveOutcome, SEARCH_SCAN_LIMIT};
