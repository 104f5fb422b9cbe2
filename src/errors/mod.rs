//! Centralized error handling for the tuner-bridge streaming plane
//!
//! Every error surfaced by the core carries a stable `kind` tag plus a
//! free-form `detail` string. The `detail` is never parsed anywhere; it
//! exists for logging. The HTTP surface adapts kinds to status codes per
//! endpoint in `web::responses`.

pub mod types;

pub use types::*;

/// Convenience type alias for results in the streaming plane
pub type StreamingResult<T> = Result<T, StreamingError>;

/// Convenience type alias for catalog access results
pub type CatalogResult<T> = Result<T, CatalogError>;
