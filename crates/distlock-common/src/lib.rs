//! Distlock Common - Shared error types and logging bootstrap
//!
//! This crate provides:
//! - `CatalogError` and the error codes reported by lock catalog operations
//! - Logging initialization for processes embedding the catalog

pub mod error;
pub mod logging;

// Re-exports for convenience
pub use error::{CatalogError, ErrorCode, Result};
pub use logging::{LoggingConfig, LoggingGuard, init_logging};
