//! Draftline Core Library
//!
//! This crate provides the domain models, error types and configuration that are
//! shared by the draft store, the render orchestrator and the operator CLI.

pub mod config;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::Config;
pub use error::{AppError, ErrorMetadata, LogLevel};
