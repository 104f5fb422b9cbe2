//! Shared utilities for the streaming plane

pub mod human_format;
pub mod url;

pub use url::UrlUtils;
