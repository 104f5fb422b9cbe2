//! Configuration default values
//!
//! All tunable defaults live here so they can be changed in one place.

// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5004;
pub const DEFAULT_BASE_URL: &str = "http://localhost:5004";

// Streaming plane defaults
pub const DEFAULT_TRANSCODER_COMMAND: &str = "ffmpeg";
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 8;
pub const DEFAULT_MAX_CONCURRENT_PREVIEWS: usize = 3;
pub const DEFAULT_RING_BUFFER_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;
pub const DEFAULT_STARTUP_DEADLINE: &str = "10s";
pub const DEFAULT_STALL_DEADLINE: &str = "30s";
pub const DEFAULT_IDLE_GRACE: &str = "15s";
pub const DEFAULT_DRAIN_DEADLINE: &str = "15s";
pub const DEFAULT_STOP_GRACE: &str = "5s";
pub const DEFAULT_AUDIT_GRACE: &str = "60s";
pub const DEFAULT_PREVIEW_IDLE_TIMEOUT: &str = "30s";
pub const DEFAULT_STATUS_REPORT_INTERVAL: &str = "30s";

// Upstream access defaults
pub const DEFAULT_CONNECT_TIMEOUT: &str = "10s";
pub const DEFAULT_BODY_TIMEOUT: &str = "30s";
pub const DEFAULT_SEGMENT_TIMEOUT: &str = "15s";
pub const DEFAULT_MAX_REDIRECT_HOPS: usize = 5;
pub const DEFAULT_RESOLVER_CACHE_TTL: &str = "25m";
pub const DEFAULT_MAX_PLAYLIST_BYTES: usize = 256 * 1024;
pub const DEFAULT_SEGMENT_CACHE_ENTRIES: usize = 1024;
pub const DEFAULT_SEGMENT_CACHE_TTL_CAP: &str = "30s";
pub const DEFAULT_SEGMENT_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_SEGMENT_RETRY_BASE: &str = "250ms";

// Resilience ladder defaults
pub const DEFAULT_RESILIENCE_N1: u32 = 3;
pub const DEFAULT_RESILIENCE_N2: u32 = 2;
pub const DEFAULT_RESILIENCE_N3: u32 = 1;
pub const DEFAULT_BASE_BACKOFF: &str = "1s";
pub const DEFAULT_MAX_BACKOFF: &str = "30s";
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.3;
pub const DEFAULT_DWELL_RESET: &str = "60s";
pub const DEFAULT_PREEMPTIVE_RENEWAL: &str = "25m";
