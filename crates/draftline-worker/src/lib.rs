//! Render task orchestration
//!
//! Dispatches the two-stage render chain to the external task queue, keeps a
//! durable row per render and reconciles finished jobs into it from a
//! background watcher.

pub mod orchestrator;
pub mod queue;
pub mod watcher;

pub use orchestrator::{
    BulkPatchOutcome, RenderConfig, RenderDispatch, RenderOrchestrator, RenderRequest,
};
pub use queue::{
    CeleryRedisQueue, ChainHandle, InMemoryRenderQueue, JobChain, JobSignature, JobState,
    JobStatus, RenderQueue,
};
pub use watcher::StatusWatcher;
