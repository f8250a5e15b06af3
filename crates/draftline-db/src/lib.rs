//! Durable storage for drafts and render tasks.
//!
//! Both tables sit behind a trait ([`DraftBackend`], [`RenderTaskStore`]) with a
//! PostgreSQL implementation and an in-process one for tests and local runs.

pub mod db;
pub mod setup;

pub use db::*;
pub use setup::setup_database;
