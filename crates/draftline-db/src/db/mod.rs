//! Repositories for the data access layer
//
// Draft payloads and their metadata
pub mod draft;
//
// Render task rows
pub mod render_task;
//
// In-process implementations of both traits
pub mod memory;

pub use draft::{DraftBackend, PostgresDraftRepository};
pub use memory::{MemoryDraftBackend, MemoryRenderTaskStore};
pub use render_task::{PostgresRenderTaskRepository, RenderTaskStore};
