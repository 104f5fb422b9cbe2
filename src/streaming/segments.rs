//! HLS segment resolver
//!
//! When a downstream asks for `/stream/{id}/{segment_file}` the media
//! playlist is fetched, the segment line matching the requested filename
//! is located (exact URI match first, then basename match), and the
//! absolute upstream URL is produced. Results are cached keyed on
//! (playlist URL, filename) with a TTL of 3× the playlist target duration,
//! capped. A miss falls back to joining the playlist base with the
//! requested filename, which keeps very old players working.

use lru::LruCache;
use reqwest::{Client, StatusCode};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::errors::ResolveError;
use crate::models::Stream;
use crate::utils::UrlUtils;

/// Segment fetch failure categories; the retry policy keys off these.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    /// 403 — treated as auth loss, never retried
    #[error("upstream denied segment access (403)")]
    AuthLost,
    /// 404 after the single rotation-race retry
    #[error("segment not found upstream")]
    Gone,
    #[error("segment fetch failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SegmentKey {
    playlist_url: String,
    filename: String,
}

struct CachedSegment {
    absolute_url: String,
    expires_at: Instant,
}

/// A fetched segment body with its upstream content type.
pub struct SegmentBody {
    pub content_type: Option<String>,
    pub bytes: bytes::Bytes,
}

/// Parsed view of a media playlist, enough to resolve segment names.
#[derive(Debug, Default)]
pub struct MediaPlaylist {
    pub segments: Vec<String>,
    pub target_duration: Option<f32>,
}

pub struct SegmentResolver {
    client: Client,
    config: UpstreamConfig,
    cache: Mutex<LruCache<SegmentKey, CachedSegment>>,
}

impl SegmentResolver {
    pub fn new(client: Client, config: UpstreamConfig) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(config.segment_cache_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            client,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Resolve a requested segment filename against the current media
    /// playlist for this session.
    pub async fn resolve_segment(
        &self,
        playlist_url: &str,
        stream: &Stream,
        filename: &str,
    ) -> Result<String, ResolveError> {
        let key = SegmentKey {
            playlist_url: playlist_url.to_string(),
            filename: filename.to_string(),
        };

        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.absolute_url.clone());
                }
                cache.pop(&key);
            }
        }

        let playlist = self.fetch_media_playlist(playlist_url, stream).await?;
        let absolute = match find_segment(&playlist.segments, filename) {
            Some(uri) => UrlUtils::join(playlist_url, uri)
                .map_err(|e| ResolveError::InvalidUrl(e.to_string()))?,
            None => {
                // Legacy fallback: join the playlist base with the raw
                // filename and let the upstream decide.
                debug!(filename, "segment not in playlist, using base-join fallback");
                UrlUtils::join(playlist_url, filename)
                    .map_err(|e| ResolveError::InvalidUrl(e.to_string()))?
            }
        };

        let ttl = playlist
            .target_duration
            .map(|td| Duration::from_secs_f32((td * 3.0).max(1.0)))
            .unwrap_or(self.config.segment_cache_ttl_cap)
            .min(self.config.segment_cache_ttl_cap);

        self.cache.lock().await.put(
            key,
            CachedSegment {
                absolute_url: absolute.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(absolute)
    }

    /// Fetch a segment body with the retry policy: exponential backoff
    /// from the configured base for network errors and 5xx, one retry for
    /// 404 (upstream rotation race), no retry for 403.
    pub async fn fetch_segment(
        &self,
        url: &str,
        stream: &Stream,
    ) -> Result<SegmentBody, SegmentError> {
        let mut retried_404 = false;
        let mut attempt: u32 = 0;

        loop {
            let result = self.try_fetch(url, stream).await;
            match result {
                Ok(body) => return Ok(body),
                Err(TryFetchError::Forbidden) => return Err(SegmentError::AuthLost),
                Err(TryFetchError::NotFound) => {
                    if retried_404 {
                        return Err(SegmentError::Gone);
                    }
                    retried_404 = true;
                    tokio::time::sleep(self.config.segment_retry_base).await;
                }
                Err(TryFetchError::Retryable(detail)) => {
                    if attempt >= self.config.segment_retry_limit {
                        return Err(SegmentError::Upstream(detail));
                    }
                    let backoff = self.config.segment_retry_base * 2u32.pow(attempt);
                    warn!(
                        url = %UrlUtils::obfuscate_credentials(url),
                        attempt,
                        ?backoff,
                        detail = %detail,
                        "segment fetch retry"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_fetch(&self, url: &str, stream: &Stream) -> Result<SegmentBody, TryFetchError> {
        let mut builder = self.client.get(url).timeout(self.config.segment_timeout);
        if let Some(username) = &stream.username {
            builder = builder.basic_auth(username, stream.password.as_deref());
        }
        for (name, value) in &stream.request_headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TryFetchError::Retryable(e.to_string()))?;

        match response.status() {
            StatusCode::FORBIDDEN => Err(TryFetchError::Forbidden),
            StatusCode::NOT_FOUND => Err(TryFetchError::NotFound),
            status if status.is_server_error() => {
                Err(TryFetchError::Retryable(format!("HTTP {status}")))
            }
            status if !status.is_success() => {
                Err(TryFetchError::Retryable(format!("HTTP {status}")))
            }
            _ => {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| TryFetchError::Retryable(e.to_string()))?;
                Ok(SegmentBody {
                    content_type,
                    bytes,
                })
            }
        }
    }

    async fn fetch_media_playlist(
        &self,
        url: &str,
        stream: &Stream,
    ) -> Result<MediaPlaylist, ResolveError> {
        let mut builder = self.client.get(url).timeout(self.config.body_timeout);
        if let Some(username) = &stream.username {
            builder = builder.basic_auth(username, stream.password.as_deref());
        }
        for (name, value) in &stream.request_headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ResolveError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ResolveError::Http(format!(
                "non-success status: {}",
                response.status()
            )));
        }

        use futures::StreamExt;
        let mut body = response.bytes_stream();
        let mut collected: Vec<u8> = Vec::with_capacity(8192);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ResolveError::Http(e.to_string()))?;
            if collected.len() + chunk.len() > self.config.max_playlist_bytes {
                collected
                    .extend_from_slice(&chunk[..(self.config.max_playlist_bytes - collected.len())]);
                break;
            }
            collected.extend_from_slice(&chunk);
        }

        Ok(parse_media_playlist(&String::from_utf8_lossy(&collected)))
    }
}

enum TryFetchError {
    Forbidden,
    NotFound,
    Retryable(String),
}

/// Extract segment URI lines and the target duration from a media
/// playlist body.
pub fn parse_media_playlist(text: &str) -> MediaPlaylist {
    let mut playlist = MediaPlaylist::default();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("#EXT-X-TARGETDURATION:") {
            playlist.target_duration = line
                .split_once(':')
                .and_then(|(_, v)| v.trim().parse::<f32>().ok());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        playlist.segments.push(line.to_string());
    }
    playlist
}

/// Locate a segment by exact URI match, falling back to basename match.
pub fn find_segment<'a>(segments: &'a [String], filename: &str) -> Option<&'a String> {
    segments
        .iter()
        .find(|uri| uri.as_str() == filename)
        .or_else(|| {
            segments
                .iter()
                .find(|uri| UrlUtils::basename(uri) == filename)
        })
}

/// Rewrite every segment URI in a media playlist so subsequent GETs route
/// back through this gateway under `path_prefix`.
pub fn rewrite_media_playlist(text: &str, path_prefix: &str) -> String {
    let prefix = path_prefix.trim_end_matches('/');
    let mut out = String::with_capacity(text.len());
    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            out.push_str(line);
        } else {
            out.push_str(prefix);
            out.push('/');
            out.push_str(UrlUtils::basename(line));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA: &str = r#"#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:42
#EXTINF:6,
seg42.ts
#EXTINF:6,
media/seg43.ts
#EXTINF:6,
https://cdn.example/abs/seg44.ts
"#;

    #[test]
    fn parse_extracts_segments_and_duration() {
        let playlist = parse_media_playlist(MEDIA);
        assert_eq!(playlist.segments.len(), 3);
        assert_eq!(playlist.target_duration, Some(6.0));
    }

    #[test]
    fn exact_match_wins_over_basename_match() {
        let playlist = parse_media_playlist(MEDIA);
        assert_eq!(
            find_segment(&playlist.segments, "seg42.ts").unwrap(),
            "seg42.ts"
        );
        // Only a basename match exists for seg43.
        assert_eq!(
            find_segment(&playlist.segments, "seg43.ts").unwrap(),
            "media/seg43.ts"
        );
        // Absolute upstream URIs also match on basename.
        assert_eq!(
            find_segment(&playlist.segments, "seg44.ts").unwrap(),
            "https://cdn.example/abs/seg44.ts"
        );
        assert!(find_segment(&playlist.segments, "seg99.ts").is_none());
    }

    #[test]
    fn playlist_rewrite_routes_segments_through_gateway() {
        let rewritten = rewrite_media_playlist(MEDIA, "/stream/abc");
        let lines: Vec<&str> = rewritten.lines().collect();
        assert!(lines.contains(&"/stream/abc/seg42.ts"));
        assert!(lines.contains(&"/stream/abc/seg43.ts"));
        assert!(lines.contains(&"/stream/abc/seg44.ts"));
        // Tags are untouched.
        assert!(lines.contains(&"#EXT-X-TARGETDURATION:6"));
    }
}
