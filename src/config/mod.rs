//! Configuration loading for tuner-bridge
//!
//! Configuration is merged from a TOML file plus `TUNER_BRIDGE_`-prefixed
//! environment variables (figment). Every timeout is a human-readable
//! duration string. Defaults live in `defaults.rs`.

use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod defaults;
pub mod duration_serde;

use crate::models::ClientClass;
use defaults::*;
use duration_serde::parse_default;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Ordered, first-match-wins client classification rules. An empty
    /// list falls back to the built-in rule set.
    #[serde(default)]
    pub client_class_rules: Vec<ClientClassRule>,
}

impl Config {
    /// Load configuration from a TOML file (if present) overlaid with
    /// `TUNER_BRIDGE_*` environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::new();
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("TUNER_BRIDGE_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Effective classification rules: configured rules, or the built-in
    /// table when the configuration supplies none.
    pub fn effective_class_rules(&self) -> Vec<ClientClassRule> {
        if self.client_class_rules.is_empty() {
            ClientClassRule::builtin_rules()
        } else {
            self.client_class_rules.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: default_base_url(),
            user_agent: default_user_agent(),
        }
    }
}

/// Which supervisor arg template a request is served with.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TemplateKind {
    MpegtsCopy,
    MpegtsReencode,
    PreviewMp4,
}

/// Supervisor arg templates. Each is an argv list containing a `[URL]`
/// placeholder that is substituted with the resolved upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeTemplates {
    #[serde(default = "default_mpegts_copy_template")]
    pub mpegts_copy: Vec<String>,
    #[serde(default = "default_mpegts_reencode_template")]
    pub mpegts_reencode: Vec<String>,
    #[serde(default = "default_preview_mp4_template")]
    pub preview_mp4: Vec<String>,
}

impl Default for TranscodeTemplates {
    fn default() -> Self {
        Self {
            mpegts_copy: default_mpegts_copy_template(),
            mpegts_reencode: default_mpegts_reencode_template(),
            preview_mp4: default_preview_mp4_template(),
        }
    }
}

impl TranscodeTemplates {
    pub fn get(&self, kind: TemplateKind) -> &[String] {
        match kind {
            TemplateKind::MpegtsCopy => &self.mpegts_copy,
            TemplateKind::MpegtsReencode => &self.mpegts_reencode,
            TemplateKind::PreviewMp4 => &self.preview_mp4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_transcoder_command")]
    pub transcoder_command: String,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_max_concurrent_previews")]
    pub max_concurrent_previews: usize,
    #[serde(default = "default_ring_buffer_bytes")]
    pub ring_buffer_bytes: usize,
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    #[serde(with = "duration_serde::duration", default = "default_startup_deadline")]
    pub startup_deadline: Duration,
    #[serde(with = "duration_serde::duration", default = "default_stall_deadline")]
    pub stall_deadline: Duration,
    /// How long a session lingers once the last subscriber detaches
    #[serde(with = "duration_serde::duration", default = "default_idle_grace")]
    pub idle_grace: Duration,
    /// Force-close deadline once DRAINING begins
    #[serde(with = "duration_serde::duration", default = "default_drain_deadline")]
    pub drain_deadline: Duration,
    /// Soft-terminate grace before the supervisor hard-kills the child
    #[serde(with = "duration_serde::duration", default = "default_stop_grace")]
    pub stop_grace: Duration,
    /// How long ENDED session records are retained before purge
    #[serde(with = "duration_serde::duration", default = "default_audit_grace")]
    pub audit_grace: Duration,
    #[serde(
        with = "duration_serde::duration",
        default = "default_preview_idle_timeout"
    )]
    pub preview_idle_timeout: Duration,
    #[serde(
        with = "duration_serde::duration",
        default = "default_status_report_interval"
    )]
    pub status_report_interval: Duration,
    #[serde(default)]
    pub transcode_template: TranscodeTemplates,
    /// Extra args spliced in before the input when the upstream is HLS
    #[serde(default = "default_hls_protocol_args")]
    pub hls_protocol_args: Vec<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            transcoder_command: default_transcoder_command(),
            max_concurrent_streams: default_max_concurrent_streams(),
            max_concurrent_previews: default_max_concurrent_previews(),
            ring_buffer_bytes: default_ring_buffer_bytes(),
            chunk_bytes: default_chunk_bytes(),
            startup_deadline: default_startup_deadline(),
            stall_deadline: default_stall_deadline(),
            idle_grace: default_idle_grace(),
            drain_deadline: default_drain_deadline(),
            stop_grace: default_stop_grace(),
            audit_grace: default_audit_grace(),
            preview_idle_timeout: default_preview_idle_timeout(),
            status_report_interval: default_status_report_interval(),
            transcode_template: TranscodeTemplates::default(),
            hls_protocol_args: default_hls_protocol_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(with = "duration_serde::duration", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde::duration", default = "default_body_timeout")]
    pub body_timeout: Duration,
    #[serde(with = "duration_serde::duration", default = "default_segment_timeout")]
    pub segment_timeout: Duration,
    /// Query parameter names that mark a beacon/tracker wrapper URL
    #[serde(default = "default_beacon_params")]
    pub beacon_params: Vec<String>,
    #[serde(default = "default_max_redirect_hops")]
    pub max_redirect_hops: usize,
    #[serde(
        with = "duration_serde::duration",
        default = "default_resolver_cache_ttl"
    )]
    pub resolver_cache_ttl: Duration,
    #[serde(default = "default_max_playlist_bytes")]
    pub max_playlist_bytes: usize,
    #[serde(default = "default_segment_cache_entries")]
    pub segment_cache_entries: usize,
    #[serde(
        with = "duration_serde::duration",
        default = "default_segment_cache_ttl_cap"
    )]
    pub segment_cache_ttl_cap: Duration,
    #[serde(default = "default_segment_retry_limit")]
    pub segment_retry_limit: u32,
    #[serde(
        with = "duration_serde::duration",
        default = "default_segment_retry_base"
    )]
    pub segment_retry_base: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            body_timeout: default_body_timeout(),
            segment_timeout: default_segment_timeout(),
            beacon_params: default_beacon_params(),
            max_redirect_hops: default_max_redirect_hops(),
            resolver_cache_ttl: default_resolver_cache_ttl(),
            max_playlist_bytes: default_max_playlist_bytes(),
            segment_cache_entries: default_segment_cache_entries(),
            segment_cache_ttl_cap: default_segment_cache_ttl_cap(),
            segment_retry_limit: default_segment_retry_limit(),
            segment_retry_base: default_segment_retry_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Layer-1 failures tolerated in a window before escalating to Layer 2
    #[serde(default = "default_n1")]
    pub n1: u32,
    /// Layer-2 failures before a session recreate
    #[serde(default = "default_n2")]
    pub n2: u32,
    /// Layer-3 failures before giving up
    #[serde(default = "default_n3")]
    pub n3: u32,
    #[serde(with = "duration_serde::duration", default = "default_base_backoff")]
    pub base_backoff: Duration,
    #[serde(with = "duration_serde::duration", default = "default_max_backoff")]
    pub max_backoff: Duration,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Continuous ACTIVE dwell after which ladder counters reset
    #[serde(with = "duration_serde::duration", default = "default_dwell_reset")]
    pub dwell_reset: Duration,
    /// Interval for proactive Layer-2 URL renewal on HLS sessions
    #[serde(
        with = "duration_serde::duration",
        default = "default_preemptive_renewal"
    )]
    pub preemptive_renewal: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            n1: default_n1(),
            n2: default_n2(),
            n3: default_n3(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            dwell_reset: default_dwell_reset(),
            preemptive_renewal: default_preemptive_renewal(),
        }
    }
}

/// One row of the client classification table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientClassRule {
    /// Case-insensitive User-Agent substring
    pub substring: String,
    pub class: ClientClass,
    pub template: TemplateKind,
    /// Whether the resilience ladder runs for sessions of this class
    #[serde(default = "default_true")]
    pub resilience: bool,
}

impl ClientClassRule {
    fn rule(
        substring: &str,
        class: ClientClass,
        template: TemplateKind,
        resilience: bool,
    ) -> Self {
        Self {
            substring: substring.to_string(),
            class,
            template,
            resilience,
        }
    }

    /// Built-in classification table, used when the configuration does
    /// not override it. Order matters: first match wins.
    pub fn builtin_rules() -> Vec<Self> {
        use ClientClass::*;
        use TemplateKind::*;
        vec![
            Self::rule("plex", TunerServer, MpegtsCopy, true),
            Self::rule("jellyfin", TunerServer, MpegtsCopy, true),
            Self::rule("emby", TunerServer, MpegtsCopy, true),
            Self::rule("channels-dvr", TunerServer, MpegtsCopy, true),
            Self::rule("roku", TunerClientLivingRoomDevice, MpegtsReencode, true),
            Self::rule("appletv", TunerClientLivingRoomDevice, MpegtsCopy, true),
            Self::rule("tvos", TunerClientLivingRoomDevice, MpegtsCopy, true),
            Self::rule("smarttv", TunerClientLivingRoomDevice, MpegtsReencode, true),
            Self::rule("bravia", TunerClientLivingRoomDevice, MpegtsReencode, true),
            Self::rule("shield", TunerClientLivingRoomDevice, MpegtsCopy, true),
            Self::rule("vlc", ExternalPlayer, MpegtsCopy, false),
            Self::rule("mpv", ExternalPlayer, MpegtsCopy, false),
            Self::rule("kodi", ExternalPlayer, MpegtsCopy, false),
            Self::rule("lavf", ExternalPlayer, MpegtsCopy, false),
            Self::rule("mozilla", WebBrowser, PreviewMp4, false),
        ]
    }
}

// Web defaults
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

// Streaming defaults
fn default_transcoder_command() -> String {
    DEFAULT_TRANSCODER_COMMAND.to_string()
}

fn default_max_concurrent_streams() -> usize {
    DEFAULT_MAX_CONCURRENT_STREAMS
}

fn default_max_concurrent_previews() -> usize {
    DEFAULT_MAX_CONCURRENT_PREVIEWS
}

fn default_ring_buffer_bytes() -> usize {
    DEFAULT_RING_BUFFER_BYTES
}

fn default_chunk_bytes() -> usize {
    DEFAULT_CHUNK_BYTES
}

fn default_startup_deadline() -> Duration {
    parse_default(DEFAULT_STARTUP_DEADLINE)
}

fn default_stall_deadline() -> Duration {
    parse_default(DEFAULT_STALL_DEADLINE)
}

fn default_idle_grace() -> Duration {
    parse_default(DEFAULT_IDLE_GRACE)
}

fn default_drain_deadline() -> Duration {
    parse_default(DEFAULT_DRAIN_DEADLINE)
}

fn default_stop_grace() -> Duration {
    parse_default(DEFAULT_STOP_GRACE)
}

fn default_audit_grace() -> Duration {
    parse_default(DEFAULT_AUDIT_GRACE)
}

fn default_preview_idle_timeout() -> Duration {
    parse_default(DEFAULT_PREVIEW_IDLE_TIMEOUT)
}

fn default_status_report_interval() -> Duration {
    parse_default(DEFAULT_STATUS_REPORT_INTERVAL)
}

fn default_mpegts_copy_template() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-reconnect",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_delay_max",
        "2",
        "-i",
        "[URL]",
        "-c",
        "copy",
        "-f",
        "mpegts",
        "pipe:1",
    ]
    .map(String::from)
    .to_vec()
}

fn default_mpegts_reencode_template() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-i",
        "[URL]",
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-b:v",
        "4000k",
        "-c:a",
        "aac",
        "-b:a",
        "192k",
        "-f",
        "mpegts",
        "pipe:1",
    ]
    .map(String::from)
    .to_vec()
}

fn default_preview_mp4_template() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-i",
        "[URL]",
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-c:a",
        "aac",
        "-movflags",
        "frag_keyframe+empty_moov+default_base_moof",
        "-f",
        "mp4",
        "pipe:1",
    ]
    .map(String::from)
    .to_vec()
}

fn default_hls_protocol_args() -> Vec<String> {
    [
        "-allowed_extensions",
        "ALL",
        "-protocol_whitelist",
        "file,http,https,tcp,tls,crypto",
    ]
    .map(String::from)
    .to_vec()
}

// Upstream defaults
fn default_connect_timeout() -> Duration {
    parse_default(DEFAULT_CONNECT_TIMEOUT)
}

fn default_body_timeout() -> Duration {
    parse_default(DEFAULT_BODY_TIMEOUT)
}

fn default_segment_timeout() -> Duration {
    parse_default(DEFAULT_SEGMENT_TIMEOUT)
}

fn default_beacon_params() -> Vec<String> {
    ["bcn", "redirect_url", "beacon", "track"]
        .map(String::from)
        .to_vec()
}

fn default_max_redirect_hops() -> usize {
    DEFAULT_MAX_REDIRECT_HOPS
}

fn default_resolver_cache_ttl() -> Duration {
    parse_default(DEFAULT_RESOLVER_CACHE_TTL)
}

fn default_max_playlist_bytes() -> usize {
    DEFAULT_MAX_PLAYLIST_BYTES
}

fn default_segment_cache_entries() -> usize {
    DEFAULT_SEGMENT_CACHE_ENTRIES
}

fn default_segment_cache_ttl_cap() -> Duration {
    parse_default(DEFAULT_SEGMENT_CACHE_TTL_CAP)
}

fn default_segment_retry_limit() -> u32 {
    DEFAULT_SEGMENT_RETRY_LIMIT
}

fn default_segment_retry_base() -> Duration {
    parse_default(DEFAULT_SEGMENT_RETRY_BASE)
}

// Resilience defaults
fn default_n1() -> u32 {
    DEFAULT_RESILIENCE_N1
}

fn default_n2() -> u32 {
    DEFAULT_RESILIENCE_N2
}

fn default_n3() -> u32 {
    DEFAULT_RESILIENCE_N3
}

fn default_base_backoff() -> Duration {
    parse_default(DEFAULT_BASE_BACKOFF)
}

fn default_max_backoff() -> Duration {
    parse_default(DEFAULT_MAX_BACKOFF)
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_dwell_reset() -> Duration {
    parse_default(DEFAULT_DWELL_RESET)
}

fn default_preemptive_renewal() -> Duration {
    parse_default(DEFAULT_PREEMPTIVE_RENEWAL)
}

fn default_true() -> bool {
    true
}
