//! Upstream resolver
//!
//! Takes a catalog Stream and produces the concrete URL handed to the
//! supervisor: beacon/tracker wrappers are unwrapped by following
//! redirects, HLS masters are fetched and a variant is selected by
//! quality preference, and encrypted masters are passed through unchanged
//! so the transcoder handles key retrieval end to end.
//!
//! Resolution failures are softened: the original URL is returned and the
//! supervisor surfaces the real failure. Master→variant selections are
//! cached below the typical signed-URL lifetime.

use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::errors::ResolveError;
use crate::models::Stream;
use crate::utils::UrlUtils;

/// Variant selection preference. `highest` is the default for tuner
/// clients; preview requests may override per request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum QualityPreference {
    #[default]
    Highest,
    Lowest,
    Medium,
}

impl QualityPreference {
    /// Map the preview query values (`low|medium|high`) onto preferences.
    pub fn from_query(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "high" | "highest" => Some(Self::Highest),
            "low" | "lowest" => Some(Self::Lowest),
            "medium" | "mid" => Some(Self::Medium),
            _ => None,
        }
    }
}

/// One `#EXT-X-STREAM-INF` entry from a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsVariant {
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
    pub uri: String,
}

/// Parse result for a fetched playlist.
#[derive(Debug, Default)]
pub struct PlaylistAnalysis {
    pub is_master: bool,
    pub is_media: bool,
    pub variants: Vec<HlsVariant>,
    pub is_encrypted: bool,
    pub encryption_method: Option<String>,
    pub target_duration: Option<f32>,
    pub segment_count: usize,
}

/// The outcome handed to the supervisor.
#[derive(Debug, Clone)]
pub struct ResolvedUpstream {
    pub url: String,
    pub encrypted: bool,
    pub selected_bandwidth: Option<u64>,
    pub selected_resolution: Option<(u32, u32)>,
}

impl ResolvedUpstream {
    fn passthrough(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            encrypted: false,
            selected_bandwidth: None,
            selected_resolution: None,
        }
    }
}

struct CachedMaster {
    final_url: String,
    variants: Vec<HlsVariant>,
    encrypted: bool,
    resolved_at: Instant,
}

/// Resolves catalog streams into concrete supervisor inputs.
pub struct UpstreamResolver {
    client: Client,
    config: UpstreamConfig,
    cache: RwLock<HashMap<String, CachedMaster>>,
}

impl UpstreamResolver {
    pub fn new(client: Client, config: UpstreamConfig) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve a stream's current upstream. `bypass_cache` is set by the
    /// resilience controller on Layer-2 renewals.
    pub async fn resolve(
        &self,
        stream: &Stream,
        preference: QualityPreference,
        bypass_cache: bool,
    ) -> ResolvedUpstream {
        self.resolve_url(&stream.url, stream, preference, bypass_cache)
            .await
    }

    /// Resolve an explicit candidate URL (primary or backup) of a stream.
    pub async fn resolve_url(
        &self,
        url: &str,
        stream: &Stream,
        preference: QualityPreference,
        bypass_cache: bool,
    ) -> ResolvedUpstream {
        // 1. Unwrap beacon/tracker wrappers.
        let target = match self.unwrap_beacon(url, stream).await {
            Ok(target) => target,
            Err(e) => {
                warn!(
                    url = %UrlUtils::obfuscate_credentials(url),
                    error = %e,
                    "beacon unwrap failed, using original URL"
                );
                url.to_string()
            }
        };

        // 2. Non-HLS targets pass straight through.
        let path = UrlUtils::strip_query_and_fragment(&target).to_ascii_lowercase();
        if !(path.ends_with(".m3u8") || path.ends_with(".m3u")) {
            return ResolvedUpstream::passthrough(target);
        }

        // 3. HLS: fetch/parse the master and select a variant.
        match self.resolve_hls(&target, stream, preference, bypass_cache).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    url = %UrlUtils::obfuscate_credentials(&target),
                    error = %e,
                    "HLS resolution failed, using playlist URL as-is"
                );
                ResolvedUpstream::passthrough(target)
            }
        }
    }

    /// Whether a URL looks like a beacon wrapper per the configured
    /// query-parameter names.
    pub fn is_beacon_url(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        parsed.query_pairs().any(|(k, _)| {
            self.config
                .beacon_params
                .iter()
                .any(|p| k.eq_ignore_ascii_case(p))
        })
    }

    /// If a beacon parameter's value is itself a (percent-encoded) URL,
    /// the target can be extracted without a network round-trip.
    fn inline_beacon_target(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        for (key, value) in parsed.query_pairs() {
            if self
                .config
                .beacon_params
                .iter()
                .any(|p| key.eq_ignore_ascii_case(p))
            {
                let decoded = urlencoding::decode(&value).ok()?;
                if decoded.starts_with("http://") || decoded.starts_with("https://") {
                    return Some(decoded.into_owned());
                }
            }
        }
        None
    }

    async fn unwrap_beacon(&self, url: &str, stream: &Stream) -> Result<String, ResolveError> {
        if !self.is_beacon_url(url) {
            return Ok(url.to_string());
        }

        if let Some(target) = self.inline_beacon_target(url) {
            debug!(
                target = %UrlUtils::obfuscate_credentials(&target),
                "beacon target extracted from query parameter"
            );
            return Ok(target);
        }

        let mut current = url.to_string();
        for hop in 0..self.config.max_redirect_hops {
            let head = self
                .apply_stream_headers(self.client.head(&current), stream)
                .timeout(self.config.connect_timeout)
                .send()
                .await;

            // Trackers that reject HEAD mostly do it with a status
            // (405/403/501), not a dropped connection; both cases retry
            // the hop with a GET whose body is never read.
            let response = match head {
                Ok(r) if r.status().is_redirection() || r.status().is_success() => r,
                Ok(r) => {
                    debug!(
                        hop,
                        status = %r.status(),
                        "HEAD rejected by beacon host, retrying hop with GET"
                    );
                    self.apply_stream_headers(self.client.get(&current), stream)
                        .timeout(self.config.connect_timeout)
                        .send()
                        .await
                        .map_err(|e| ResolveError::Http(e.to_string()))?
                }
                Err(_) => self
                    .apply_stream_headers(self.client.get(&current), stream)
                    .timeout(self.config.connect_timeout)
                    .send()
                    .await
                    .map_err(|e| ResolveError::Http(e.to_string()))?,
            };

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ResolveError::Http("redirect without location".into()))?;
                current = UrlUtils::join(&current, location)
                    .map_err(|e| ResolveError::InvalidUrl(e.to_string()))?;
                debug!(hop, target = %UrlUtils::obfuscate_credentials(&current), "beacon redirect followed");
            } else {
                // Final target reached: the response URL accounts for any
                // redirects reqwest followed internally.
                return Ok(response.url().to_string());
            }
        }
        Ok(current)
    }

    async fn resolve_hls(
        &self,
        master_url: &str,
        stream: &Stream,
        preference: QualityPreference,
        bypass_cache: bool,
    ) -> Result<ResolvedUpstream, ResolveError> {
        if !bypass_cache {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(master_url) {
                if cached.resolved_at.elapsed() < self.config.resolver_cache_ttl {
                    return Ok(self.select_from(master_url, cached, preference));
                }
            }
        }

        let (final_url, text) = self.fetch_playlist_bounded(master_url, stream).await?;
        let analysis = analyze_playlist(&text);

        if !analysis.is_master {
            if analysis.is_media {
                // Media playlist: nothing to select, the transcoder
                // consumes it directly.
                return Ok(ResolvedUpstream {
                    url: final_url,
                    encrypted: analysis.is_encrypted,
                    selected_bandwidth: None,
                    selected_resolution: None,
                });
            }
            return Err(ResolveError::NotHls);
        }

        let cached = CachedMaster {
            final_url: final_url.clone(),
            variants: analysis.variants,
            encrypted: analysis.is_encrypted,
            resolved_at: Instant::now(),
        };
        let resolved = self.select_from(master_url, &cached, preference);
        self.cache.write().await.insert(master_url.to_string(), cached);
        Ok(resolved)
    }

    fn select_from(
        &self,
        master_url: &str,
        cached: &CachedMaster,
        preference: QualityPreference,
    ) -> ResolvedUpstream {
        // Encrypted HLS: never switch variants — the master URL goes to
        // the transcoder unchanged so key retrieval stays end to end.
        if cached.encrypted {
            return ResolvedUpstream {
                url: master_url.to_string(),
                encrypted: true,
                selected_bandwidth: None,
                selected_resolution: None,
            };
        }

        let Some(variant) = select_variant(&cached.variants, preference) else {
            return ResolvedUpstream::passthrough(cached.final_url.clone());
        };

        let absolute = UrlUtils::join(&cached.final_url, &variant.uri)
            .unwrap_or_else(|_| variant.uri.clone());
        debug!(
            master = %UrlUtils::obfuscate_credentials(master_url),
            bandwidth = variant.bandwidth,
            resolution = ?variant.resolution,
            %preference,
            "selected HLS variant"
        );
        ResolvedUpstream {
            url: absolute,
            encrypted: false,
            selected_bandwidth: Some(variant.bandwidth),
            selected_resolution: variant.resolution,
        }
    }

    /// Fetch a playlist with the stream's auth/headers, reading at most
    /// `max_playlist_bytes`. Returns the final URL after redirects plus
    /// the body text.
    pub async fn fetch_playlist_bounded(
        &self,
        url: &str,
        stream: &Stream,
    ) -> Result<(String, String), ResolveError> {
        let response = self
            .apply_stream_headers(self.client.get(url), stream)
            .timeout(self.config.body_timeout)
            .send()
            .await
            .map_err(|e| ResolveError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ResolveError::Http(format!(
                "non-success status: {}",
                response.status()
            )));
        }

        let final_url = response.url().to_string();

        use futures::StreamExt;
        let mut body = response.bytes_stream();
        let mut collected: Vec<u8> = Vec::with_capacity(8192);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ResolveError::Http(e.to_string()))?;
            if collected.len() + chunk.len() > self.config.max_playlist_bytes {
                collected.extend_from_slice(&chunk[..(self.config.max_playlist_bytes - collected.len())]);
                break;
            }
            collected.extend_from_slice(&chunk);
        }

        Ok((final_url, String::from_utf8_lossy(&collected).to_string()))
    }

    /// Apply a stream's basic auth and custom headers to an upstream
    /// request builder.
    pub fn apply_stream_headers(
        &self,
        mut builder: reqwest::RequestBuilder,
        stream: &Stream,
    ) -> reqwest::RequestBuilder {
        if let Some(username) = &stream.username {
            builder = builder.basic_auth(username, stream.password.as_deref());
        }
        for (name, value) in &stream.request_headers {
            builder = builder.header(name, value);
        }
        builder
    }

    /// Drop a cached master entry (Layer-2 renewals call resolve with
    /// `bypass_cache`, then the fresh result replaces this anyway).
    pub async fn invalidate(&self, master_url: &str) {
        self.cache.write().await.remove(master_url);
    }
}

/// Pick a variant by preference over the bandwidth ordering.
pub fn select_variant(
    variants: &[HlsVariant],
    preference: QualityPreference,
) -> Option<&HlsVariant> {
    if variants.is_empty() {
        return None;
    }
    let mut ordered: Vec<&HlsVariant> = variants.iter().collect();
    ordered.sort_by_key(|v| v.bandwidth);
    let index = match preference {
        QualityPreference::Lowest => 0,
        QualityPreference::Highest => ordered.len() - 1,
        QualityPreference::Medium => ordered.len() / 2,
    };
    Some(ordered[index])
}

/// Lightweight single-pass playlist analyzer.
pub fn analyze_playlist(text: &str) -> PlaylistAnalysis {
    let mut analysis = PlaylistAnalysis::default();
    let mut pending: Option<HlsVariant> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            analysis.is_master = true;
            pending = Some(parse_stream_inf(attrs));
            continue;
        }
        if line.starts_with("#EXT-X-TARGETDURATION:") {
            analysis.target_duration = line
                .split_once(':')
                .and_then(|(_, v)| v.trim().parse::<f32>().ok());
            continue;
        }
        if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            let method = attr_value(attrs, "METHOD").unwrap_or_default();
            if !method.eq_ignore_ascii_case("NONE") {
                analysis.is_encrypted = true;
                analysis.encryption_method = Some(method);
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        // URI line: belongs to the pending variant on a master, or is a
        // media segment otherwise.
        if let Some(mut variant) = pending.take() {
            variant.uri = line.to_string();
            analysis.variants.push(variant);
        } else {
            analysis.is_media = true;
            analysis.segment_count += 1;
        }
    }

    analysis
}

fn parse_stream_inf(attrs: &str) -> HlsVariant {
    HlsVariant {
        bandwidth: attr_value(attrs, "BANDWIDTH")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0),
        resolution: attr_value(attrs, "RESOLUTION").and_then(|v| {
            let (w, h) = v.split_once('x')?;
            Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?))
        }),
        codecs: attr_value(attrs, "CODECS"),
        uri: String::new(),
    }
}

/// Extract one attribute from an HLS attribute list, respecting quoted
/// values (CODECS contains commas).
fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let mut rest = attrs;
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];
        let (value, remaining) = if let Some(stripped) = after.strip_prefix('"') {
            let close = stripped.find('"')?;
            (&stripped[..close], stripped[close + 1..].trim_start_matches(','))
        } else {
            match after.find(',') {
                Some(comma) => (&after[..comma], &after[comma + 1..]),
                None => (after, ""),
            }
        };
        if key.eq_ignore_ascii_case(name) {
            return Some(value.to_string());
        }
        rest = remaining;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = r#"#EXTM3U
#EXT-X-VERSION:4
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS="avc1.4d401e,mp4a.40.2"
low/playlist.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,CODECS="avc1.4d401f,mp4a.40.2"
mid/playlist.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=6000000,RESOLUTION=1920x1080,CODECS="avc1.640028,mp4a.40.2"
hi/playlist.m3u8
"#;

    #[test]
    fn master_parse_extracts_variant_tuples() {
        let analysis = analyze_playlist(MASTER);
        assert!(analysis.is_master);
        assert!(!analysis.is_encrypted);
        assert_eq!(analysis.variants.len(), 3);
        assert_eq!(analysis.variants[0].bandwidth, 800_000);
        assert_eq!(analysis.variants[1].resolution, Some((1280, 720)));
        assert_eq!(
            analysis.variants[2].codecs.as_deref(),
            Some("avc1.640028,mp4a.40.2")
        );
        assert_eq!(analysis.variants[2].uri, "hi/playlist.m3u8");
    }

    #[test]
    fn quality_preference_selects_by_bandwidth() {
        let analysis = analyze_playlist(MASTER);
        assert_eq!(
            select_variant(&analysis.variants, QualityPreference::Highest)
                .unwrap()
                .bandwidth,
            6_000_000
        );
        assert_eq!(
            select_variant(&analysis.variants, QualityPreference::Lowest)
                .unwrap()
                .bandwidth,
            800_000
        );
        assert_eq!(
            select_variant(&analysis.variants, QualityPreference::Medium)
                .unwrap()
                .bandwidth,
            2_000_000
        );
    }

    #[test]
    fn single_variant_master_needs_no_selection_logic() {
        let single = r#"#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720
only/playlist.m3u8
"#;
        let analysis = analyze_playlist(single);
        assert_eq!(analysis.variants.len(), 1);
        for pref in [
            QualityPreference::Highest,
            QualityPreference::Lowest,
            QualityPreference::Medium,
        ] {
            assert_eq!(
                select_variant(&analysis.variants, pref).unwrap().uri,
                "only/playlist.m3u8"
            );
        }
    }

    #[test]
    fn encrypted_master_detected_with_method() {
        let encrypted = r#"#EXTM3U
#EXT-X-KEY:METHOD=AES-128,URI="https://keys.example/k1",IV=0x1234
#EXT-X-STREAM-INF:BANDWIDTH=2000000
enc/playlist.m3u8
"#;
        let analysis = analyze_playlist(encrypted);
        assert!(analysis.is_encrypted);
        assert_eq!(analysis.encryption_method.as_deref(), Some("AES-128"));
    }

    #[test]
    fn key_method_none_is_not_encryption() {
        let playlist = r#"#EXTM3U
#EXT-X-KEY:METHOD=NONE
#EXTINF:6,
seg1.ts
"#;
        let analysis = analyze_playlist(playlist);
        assert!(!analysis.is_encrypted);
        assert!(analysis.is_media);
    }

    #[test]
    fn media_playlist_counts_segments() {
        let media = r#"#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6,
seg1.ts
#EXTINF:6,
seg2.ts
"#;
        let analysis = analyze_playlist(media);
        assert!(!analysis.is_master);
        assert!(analysis.is_media);
        assert_eq!(analysis.segment_count, 2);
        assert_eq!(analysis.target_duration, Some(6.0));
    }

    #[test]
    fn attr_parser_respects_quoted_commas() {
        let attrs = r#"BANDWIDTH=800000,CODECS="avc1.4d401e,mp4a.40.2",RESOLUTION=640x360"#;
        assert_eq!(attr_value(attrs, "BANDWIDTH").as_deref(), Some("800000"));
        assert_eq!(
            attr_value(attrs, "CODECS").as_deref(),
            Some("avc1.4d401e,mp4a.40.2")
        );
        assert_eq!(attr_value(attrs, "RESOLUTION").as_deref(), Some("640x360"));
        assert_eq!(attr_value(attrs, "MISSING"), None);
    }

    #[test]
    fn quality_preference_query_mapping() {
        assert_eq!(
            QualityPreference::from_query("high"),
            Some(QualityPreference::Highest)
        );
        assert_eq!(
            QualityPreference::from_query("LOW"),
            Some(QualityPreference::Lowest)
        );
        assert_eq!(
            QualityPreference::from_query("medium"),
            Some(QualityPreference::Medium)
        );
        assert_eq!(QualityPreference::from_query("ultra"), None);
    }

    #[tokio::test]
    async fn beacon_detection_uses_configured_params() {
        let resolver = UpstreamResolver::new(Client::new(), UpstreamConfig::default());
        assert!(resolver.is_beacon_url("http://t.example/r?bcn=abc&u=1"));
        assert!(resolver.is_beacon_url("http://t.example/r?redirect_url=http%3A%2F%2Fx"));
        assert!(!resolver.is_beacon_url("http://cdn.example/live.m3u8?token=x"));
    }

    #[tokio::test]
    async fn inline_beacon_target_is_extracted_without_network() {
        let resolver = UpstreamResolver::new(Client::new(), UpstreamConfig::default());
        assert_eq!(
            resolver.inline_beacon_target(
                "http://t.example/r?redirect_url=http%3A%2F%2Fcdn%2Flive.m3u8%3Ftoken%3Dx"
            ),
            Some("http://cdn/live.m3u8?token=x".to_string())
        );
        // Opaque beacon ids still require the redirect chase.
        assert_eq!(
            resolver.inline_beacon_target("http://t.example/r?bcn=abc123"),
            None
        );
    }
}
