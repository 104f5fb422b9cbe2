//! Error-to-HTTP adaptation
//!
//! The core returns a uniform `{kind, detail}`; this module is the single
//! place that picks a representation per endpoint family. Tuner paths get
//! a bare status with an empty body (media servers ignore bodies);
//! preview and API paths get a compact JSON body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::errors::{ErrorKind, StreamingError};

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::SessionConflict => StatusCode::CONFLICT,
        ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::BadUpstream => StatusCode::BAD_GATEWAY,
        ErrorKind::ClientGone => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Tuner-path representation: status code, empty body.
pub fn tuner_error(err: &StreamingError) -> Response {
    let mut status = status_for(err.kind);
    // The conflict policy on the tuner path maps to 409 per contract;
    // everything else follows the shared table.
    if err.kind == ErrorKind::SessionConflict {
        status = StatusCode::CONFLICT;
    }
    tracing::warn!(kind = %err.kind, detail = %err.detail, "tuner request failed");
    status.into_response()
}

/// Preview/API representation: status code plus `{kind, detail}` JSON.
pub fn preview_error(err: &StreamingError) -> Response {
    // The preview path reports conflicts as transient unavailability.
    let status = if err.kind == ErrorKind::SessionConflict {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        status_for(err.kind)
    };
    tracing::warn!(kind = %err.kind, detail = %err.detail, "preview request failed");
    (
        status,
        Json(json!({
            "kind": err.kind,
            "detail": err.detail,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_to_status_table() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(ErrorKind::CapacityExhausted),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(ErrorKind::SessionConflict), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::UpstreamUnavailable),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn preview_conflict_downgrades_to_unavailable() {
        let err = StreamingError::conflict("busy");
        let response = preview_error(&err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
