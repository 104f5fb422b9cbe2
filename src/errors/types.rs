//! Error type definitions for tuner-bridge
//!
//! The streaming plane has a single flat taxonomy (`ErrorKind`) so that
//! every failure can be mapped to an HTTP status or a log line without
//! string inspection. Sub-domains (supervisor, resolver) keep their own
//! thiserror enums and convert into `StreamingError` at the seam.

use thiserror::Error;

/// Stable error kinds surfaced by the streaming core.
///
/// These are independent of transport: the web layer maps them to status
/// codes, the resilience controller feeds some of them back into its
/// ladder, and the audit row records the final one on session end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Channel or stream id unknown
    NotFound,
    /// Concurrency cap reached
    CapacityExhausted,
    /// A healthy session already owns this channel for this client
    SessionConflict,
    /// Resilience ladder exhausted
    UpstreamUnavailable,
    /// Expected a playlist, could not parse one
    BadUpstream,
    /// Downstream disconnected mid-response
    ClientGone,
    /// Invariant violation inside the core
    Internal,
}

/// The core error type: a kind tag plus a human-oriented detail string.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct StreamingError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl StreamingError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(resource: &str, id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{resource} {id} not found"))
    }

    pub fn capacity(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapacityExhausted, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionConflict, detail)
    }

    pub fn upstream_unavailable(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, detail)
    }

    pub fn bad_upstream(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadUpstream, detail)
    }

    pub fn client_gone(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientGone, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }
}

/// Subprocess supervisor failures.
///
/// Spawn failures are fatal to an invocation; everything after a
/// successful spawn is reported through the supervisor event channel
/// instead of this enum.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn transcoder: {0}")]
    SpawnFailed(String),

    #[error("transcoder produced no output within startup deadline ({0:?})")]
    StartupTimeout(std::time::Duration),

    #[error("arg template has no [URL] placeholder: {0}")]
    BadTemplate(String),

    #[error("I/O error on child pipes: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SupervisorError> for StreamingError {
    fn from(e: SupervisorError) -> Self {
        StreamingError::internal(e.to_string())
    }
}

/// Upstream resolver failures. Most are softened back to the original
/// URL (the supervisor then surfaces the real failure); `NotHls` in a
/// context that required a playlist becomes `BadUpstream`.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("content is not an HLS playlist")]
    NotHls,
}

impl From<ResolveError> for StreamingError {
    fn from(e: ResolveError) -> Self {
        StreamingError::bad_upstream(e.to_string())
    }
}

/// Catalog access failures. The catalog is an external collaborator; the
/// core only distinguishes "row missing" from "store broken".
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    #[error("catalog store error: {0}")]
    Store(String),
}

impl CatalogError {
    pub fn not_found(resource: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }
}

impl From<CatalogError> for StreamingError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound { resource, id } => StreamingError::not_found(&resource, id),
            CatalogError::Store(msg) => StreamingError::internal(msg),
        }
    }
}
