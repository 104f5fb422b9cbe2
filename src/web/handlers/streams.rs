//! Streaming surface handlers
//!
//! Thin handlers: extract client facts, delegate to the streaming engine,
//! adapt errors per path. The tuner entry always answers with
//! `Content-Type: video/mp2t`; CORS is applied on preview routes only (in
//! the router layer).

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::StreamingError;
use crate::models::{Channel, Stream};
use crate::streaming::client_class::ClassificationInput;
use crate::streaming::preview::{PreviewOptions, PreviewTranscoder};
use crate::streaming::registry::{ActivityKind, ClientIdentity, SessionKind};
use crate::streaming::resolver::QualityPreference;
use crate::streaming::segments::{SegmentError, rewrite_media_playlist};
use crate::web::AppState;
use crate::web::responses::{preview_error, tuner_error};

const MPEGTS_CONTENT_TYPE: &str = "video/mp2t";

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    /// Consumer alias the media server attaches to its probes
    pub session: Option<String>,
    pub quality: Option<String>,
    pub transcode: Option<bool>,
    pub class: Option<String>,
}

fn client_identity(headers: &HeaderMap) -> ClientIdentity {
    let ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    ClientIdentity { ip, user_agent }
}

fn classification_input<'a>(
    headers: &'a HeaderMap,
    query: &'a StreamQuery,
) -> ClassificationInput<'a> {
    let has_tuner_server_header = headers.keys().any(|name| {
        let name = name.as_str();
        name.starts_with("x-plex")
            || name.starts_with("x-emby")
            || name.starts_with("x-jellyfin")
    });
    ClassificationInput {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok()),
        accept: headers.get(header::ACCEPT).and_then(|h| h.to_str().ok()),
        has_tuner_server_header,
        query_class: query.class.as_deref(),
        query_transcode: query.transcode,
    }
}

/// Resolve a path id into its channel and stream. Accepts a channel
/// number, a channel UUID, or a stream UUID.
async fn lookup(state: &AppState, id: &str) -> Result<(Option<Channel>, Stream), StreamingError> {
    let catalog = &state.engine.catalog;

    if let Ok(number) = id.parse::<u32>() {
        let channel = catalog.get_channel_by_number(number).await?;
        let stream = catalog.get_stream_for_channel(channel.id).await?;
        return Ok((Some(channel), stream));
    }

    let uuid =
        Uuid::parse_str(id).map_err(|_| StreamingError::not_found("channel or stream", id))?;

    if let Ok(channel) = catalog.get_channel_by_id(uuid).await {
        let stream = catalog.get_stream_for_channel(channel.id).await?;
        return Ok((Some(channel), stream));
    }
    let stream = catalog.get_stream_by_id(uuid).await?;
    Ok((None, stream))
}

/// `GET|HEAD /stream/{id}` — the tuner entry. The body is MPEG-TS.
pub async fn tuner_stream(
    method: Method,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let (channel, stream) = match lookup(&state, &id).await {
        Ok(found) => found,
        Err(e) => return tuner_error(&e),
    };
    if !stream.enabled || channel.as_ref().is_some_and(|c| !c.enabled) {
        return tuner_error(&StreamingError::not_found("stream", &id));
    }

    let classification = state.classifier.classify(&classification_input(&headers, &query));

    // The media server commonly probes with HEAD before the real GET;
    // answer without creating a session so the probe never counts toward
    // the subscriber count.
    if method == Method::HEAD {
        if let Some(alias) = &query.session {
            state
                .engine
                .registry
                .touch_activity(alias, ActivityKind::KeepAlive)
                .await;
        }
        return ([(header::CONTENT_TYPE, MPEGTS_CONTENT_TYPE)], StatusCode::OK).into_response();
    }

    let identity = client_identity(&headers);
    let channel_id = channel.map(|c| c.id).unwrap_or(stream.channel_id);
    let quality = query
        .quality
        .as_deref()
        .and_then(QualityPreference::from_query)
        .unwrap_or_default();

    debug!(
        id = %id,
        channel_id = %channel_id,
        class = %classification.class,
        client_ip = %identity.ip,
        "tuner stream request"
    );

    let record = match state
        .engine
        .open_session(
            channel_id,
            stream,
            SessionKind::Tuner,
            identity,
            classification,
            quality,
            query.session.clone(),
            state.config.streaming.idle_grace,
        )
        .await
    {
        Ok(record) => record,
        Err(e) => return tuner_error(&e),
    };

    if let Some(alias) = &query.session {
        if let Err(e) = state
            .engine
            .registry
            .attach(&record.session_id.to_string(), alias)
            .await
        {
            warn!(session_id = %record.session_id, alias = %alias, error = %e, "alias attach refused");
        }
    }

    let subscription = match state
        .engine
        .subscribe(&record, classification.join, classification.lag)
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => return tuner_error(&e),
    };

    info!(
        session_id = %record.session_id,
        subscriber_id = %subscription.id(),
        "tuner subscriber attached"
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MPEGTS_CONTENT_TYPE)
        .body(Body::from_stream(subscription.into_byte_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `GET /stream/{id}/{segment}` — HLS sub-resource proxy. `.m3u8` returns
/// the rewritten media playlist; media segments are passed through with
/// the upstream content type.
pub async fn stream_segment(
    Path((id, segment)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let (_, stream) = match lookup(&state, &id).await {
        Ok(found) => found,
        Err(e) => return tuner_error(&e),
    };

    // Prefer the live session's resolved upstream (the selected variant);
    // fall back to a fresh resolution otherwise.
    let identity = client_identity(&headers);
    let playlist_url = match state
        .engine
        .registry
        .find_live(stream.channel_id, SessionKind::Tuner, &identity)
        .await
    {
        Some(record) => {
            record.touch_activity(ActivityKind::SegmentRequest).await;
            record.upstream_url().await
        }
        None => {
            state
                .engine
                .resolver
                .resolve(&stream, QualityPreference::default(), false)
                .await
                .url
        }
    };
    if let Some(alias) = &query.session {
        state
            .engine
            .registry
            .touch_activity(alias, ActivityKind::SegmentRequest)
            .await;
    }

    if segment.ends_with(".m3u8") {
        let playlist = match state
            .engine
            .resolver
            .fetch_playlist_bounded(&playlist_url, &stream)
            .await
        {
            Ok((_, text)) => text,
            Err(e) => return tuner_error(&StreamingError::from(e)),
        };
        let rewritten = rewrite_media_playlist(&playlist, &format!("/stream/{id}"));
        return (
            [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
            rewritten,
        )
            .into_response();
    }

    let absolute = match state
        .segments
        .resolve_segment(&playlist_url, &stream, &segment)
        .await
    {
        Ok(url) => url,
        Err(e) => return tuner_error(&StreamingError::from(e)),
    };

    match state.segments.fetch_segment(&absolute, &stream).await {
        Ok(body) => {
            let content_type = body
                .content_type
                .unwrap_or_else(|| MPEGTS_CONTENT_TYPE.to_string());
            ([(header::CONTENT_TYPE, content_type)], body.bytes).into_response()
        }
        Err(SegmentError::AuthLost) => StatusCode::FORBIDDEN.into_response(),
        Err(SegmentError::Gone) => StatusCode::NOT_FOUND.into_response(),
        Err(SegmentError::Upstream(detail)) => {
            tuner_error(&StreamingError::upstream_unavailable(detail))
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct PreviewQuery {
    pub quality: Option<String>,
    pub transcode: Option<bool>,
    /// Idle timeout override in milliseconds
    pub timeout: Option<u64>,
    pub class: Option<String>,
}

/// `GET /streams/preview/{stream_id}` — browser preview path.
pub async fn preview_stream(
    Path(stream_id): Path<String>,
    Query(query): Query<PreviewQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let stream = {
        let uuid = match Uuid::parse_str(&stream_id) {
            Ok(uuid) => uuid,
            Err(_) => {
                return preview_error(&StreamingError::not_found("stream", &stream_id));
            }
        };
        match state.engine.catalog.get_stream_by_id(uuid).await {
            Ok(stream) => stream,
            Err(e) => return preview_error(&e.into()),
        }
    };

    let stream_query = StreamQuery {
        session: None,
        quality: query.quality.clone(),
        transcode: query.transcode,
        class: query.class.clone(),
    };
    let classification = state
        .classifier
        .classify(&classification_input(&headers, &stream_query));
    let identity = client_identity(&headers);

    let options = PreviewOptions {
        quality: query.quality.as_deref().and_then(QualityPreference::from_query),
        transcode: query.transcode,
        timeout: query.timeout.map(Duration::from_millis),
    };

    let (record, subscription) = match state
        .preview
        .open(stream, identity, classification.class, options)
        .await
    {
        Ok(opened) => opened,
        Err(e) => return preview_error(&e),
    };

    info!(
        session_id = %record.session_id,
        class = %classification.class,
        "preview subscriber attached"
    );

    let content_type = PreviewTranscoder::content_type(classification.class, query.transcode);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(subscription.into_byte_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `GET /streams/active` — registry snapshot plus capacity readout.
pub async fn active_sessions(State(state): State<AppState>) -> Response {
    let sessions = state.engine.active_snapshot().await;
    let current = sessions.iter().filter(|s| !s.state.is_terminal()).count();
    let body = serde_json::json!({
        "sessions": sessions,
        "capacity": {
            "current": current,
            "max": state.engine.registry.capacity(SessionKind::Tuner),
        },
    });
    axum::Json(body).into_response()
}
