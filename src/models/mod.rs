//! Data model types shared across the streaming plane
//!
//! Channels and streams are read-only projections of the external catalog;
//! the streaming plane treats them as immutable for the duration of a
//! session. Session snapshots and audit rows are produced by the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A numbered tuner channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    /// Unique positive channel number as presented to the media server
    pub number: u32,
    pub name: String,
    pub enabled: bool,
    pub logo_url: Option<String>,
    /// Key linking this channel into the external programme guide
    pub guide_key: Option<String>,
}

/// Transport protocol of an upstream source.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StreamProtocol {
    Hls,
    Http,
    Rtsp,
    Rtmp,
    Udp,
    Mms,
    Srt,
    Ts,
}

impl StreamProtocol {
    /// Best-effort protocol guess from a URL, used when the catalog row
    /// carries no explicit tag.
    pub fn infer_from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("rtsp://") {
            Self::Rtsp
        } else if lower.starts_with("rtmp://") || lower.starts_with("rtmps://") {
            Self::Rtmp
        } else if lower.starts_with("udp://") {
            Self::Udp
        } else if lower.starts_with("mms://") || lower.starts_with("mmsh://") {
            Self::Mms
        } else if lower.starts_with("srt://") {
            Self::Srt
        } else {
            let path_end = lower.find(['?', '#']).unwrap_or(lower.len());
            let path = &lower[..path_end];
            if path.ends_with(".m3u8") || path.ends_with(".m3u") {
                Self::Hls
            } else if path.ends_with(".ts") {
                Self::Ts
            } else {
                Self::Http
            }
        }
    }
}

/// An upstream stream definition bound to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub url: String,
    /// Ordered failover targets tried when the primary is exhausted
    #[serde(default)]
    pub backup_urls: Vec<String>,
    pub protocol: StreamProtocol,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra request headers sent on every upstream HTTP request
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// Protocol-specific option map passed through to the transcoder
    #[serde(default)]
    pub protocol_options: HashMap<String, String>,
    pub enabled: bool,
}

impl Stream {
    /// All candidate URLs in failover order, primary first.
    pub fn candidate_urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.backup_urls.iter().map(String::as_str))
    }
}

/// Coarse category of a downstream HTTP client, derived from User-Agent,
/// headers, and query parameters. Drives arg-template selection, join
/// policy and resilience defaults.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ClientClass {
    TunerServer,
    TunerClientLivingRoomDevice,
    WebBrowser,
    ExternalPlayer,
}

/// Lifecycle state of a streaming session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Recovering,
    Draining,
    Ended,
}

impl SessionState {
    /// ENDED is terminal; every other state can still transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended)
    }
}

/// Monotonic counters kept per session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    pub supervisor_restarts: u64,
    pub inband_reconnects: u64,
    pub url_renewals: u64,
    pub bytes_forwarded: u64,
    pub consecutive_failures: u32,
}

/// Read-only view of a session for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub channel_id: Uuid,
    pub consumer_ids: Vec<String>,
    pub state: SessionState,
    pub client_class: ClientClass,
    pub upstream_url: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_supervisor_start_at: Option<DateTime<Utc>>,
    pub last_upstream_renewal_at: Option<DateTime<Utc>>,
    pub counters: SessionCounters,
    pub subscriber_count: usize,
    pub supervisor_pid: Option<u32>,
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_mb: Option<f64>,
}

/// Row appended to the catalog when a session reaches ENDED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAuditRow {
    pub session_id: Uuid,
    pub channel_id: Uuid,
    pub client_class: ClientClass,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub bytes_forwarded: u64,
    pub supervisor_restarts: u64,
    pub end_reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_inference_covers_schemes_and_extensions() {
        assert_eq!(
            StreamProtocol::infer_from_url("rtsp://cam.local/live"),
            StreamProtocol::Rtsp
        );
        assert_eq!(
            StreamProtocol::infer_from_url("http://a/b/master.m3u8?token=x"),
            StreamProtocol::Hls
        );
        assert_eq!(
            StreamProtocol::infer_from_url("http://a/b/feed.ts"),
            StreamProtocol::Ts
        );
        assert_eq!(
            StreamProtocol::infer_from_url("https://a/b/video"),
            StreamProtocol::Http
        );
        assert_eq!(
            StreamProtocol::infer_from_url("srt://host:9000"),
            StreamProtocol::Srt
        );
    }

    #[test]
    fn candidate_urls_keep_failover_order() {
        let stream = Stream {
            id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            url: "http://primary/live".into(),
            backup_urls: vec!["http://backup1/live".into(), "http://backup2/live".into()],
            protocol: StreamProtocol::Http,
            username: None,
            password: None,
            request_headers: HashMap::new(),
            protocol_options: HashMap::new(),
            enabled: true,
        };
        let urls: Vec<_> = stream.candidate_urls().collect();
        assert_eq!(
            urls,
            vec!["http://primary/live", "http://backup1/live", "http://backup2/live"]
        );
    }

    #[test]
    fn ended_is_the_only_terminal_state() {
        for state in [
            SessionState::Starting,
            SessionState::Active,
            SessionState::Recovering,
            SessionState::Draining,
        ] {
            assert!(!state.is_terminal());
        }
        assert!(SessionState::Ended.is_terminal());
    }
}
