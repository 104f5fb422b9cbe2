//! Transcoder stderr classification
//!
//! The supervisor is the only component allowed to branch on stderr text;
//! it does so exclusively through this table. Matching is case-insensitive
//! substring search over a fixed, ordered pattern list — the first hit
//! wins, so broader patterns (HTTP status families) are placed before the
//! narrower auth phrases they would otherwise shadow.

use serde::Serialize;

/// Typed failure category extracted from a transcoder stderr line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StderrErrorKind {
    NetworkTimeout,
    Http4xx,
    Http5xx,
    PeerReset,
    Eof,
    Auth,
    DecoderCorruption,
    Decryption,
    Unknown,
}

impl StderrErrorKind {
    /// Kinds that indicate the upstream connection died and an in-band
    /// reconnect is worth attempting.
    pub fn is_transient_network(self) -> bool {
        matches!(
            self,
            StderrErrorKind::NetworkTimeout | StderrErrorKind::PeerReset | StderrErrorKind::Eof
        )
    }

    /// Kinds that force a URL renewal rather than a plain reconnect.
    pub fn needs_renewal(self) -> bool {
        matches!(
            self,
            StderrErrorKind::DecoderCorruption | StderrErrorKind::Decryption
        )
    }
}

/// Ordered pattern table. First match wins.
const STDERR_PATTERNS: &[(&str, StderrErrorKind)] = &[
    ("connection timed out", StderrErrorKind::NetworkTimeout),
    ("timed out", StderrErrorKind::NetworkTimeout),
    ("would block", StderrErrorKind::NetworkTimeout),
    ("server returned 4", StderrErrorKind::Http4xx),
    ("server returned 5", StderrErrorKind::Http5xx),
    ("connection reset", StderrErrorKind::PeerReset),
    ("broken pipe", StderrErrorKind::PeerReset),
    ("end of file", StderrErrorKind::Eof),
    ("eof", StderrErrorKind::Eof),
    ("unauthorized", StderrErrorKind::Auth),
    ("403 forbidden", StderrErrorKind::Auth),
    ("non-existing pps", StderrErrorKind::DecoderCorruption),
    ("decode_slice_header error", StderrErrorKind::DecoderCorruption),
    ("no frame!", StderrErrorKind::DecoderCorruption),
    ("concealing errors", StderrErrorKind::DecoderCorruption),
    ("slice header damaged", StderrErrorKind::DecoderCorruption),
    ("unable to open key", StderrErrorKind::Decryption),
    ("invalid key", StderrErrorKind::Decryption),
    ("decryption", StderrErrorKind::Decryption),
];

/// Lines that look like errors at all; anything else is plain status
/// output and produces no classified event.
const ERROR_MARKERS: &[&str] = &[
    "error",
    "failed",
    "invalid",
    "could not",
    "unable to",
    "not found",
    "timed out",
    "would block",
    "server returned",
    "connection reset",
    "broken pipe",
    "end of file",
    "eof",
    "unauthorized",
    "forbidden",
    "no frame!",
    "concealing",
    "damaged",
];

/// Classify one stderr line. Returns `None` for ordinary status output,
/// `Some(kind)` for anything that looks like a failure.
pub fn classify_stderr_line(line: &str) -> Option<StderrErrorKind> {
    let lower = line.to_lowercase();

    for (pattern, kind) in STDERR_PATTERNS {
        if lower.contains(pattern) {
            return Some(*kind);
        }
    }

    if ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(StderrErrorKind::Unknown);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_failures() {
        assert_eq!(
            classify_stderr_line("tcp: connection timed out"),
            Some(StderrErrorKind::NetworkTimeout)
        );
        assert_eq!(
            classify_stderr_line("Connection reset by peer"),
            Some(StderrErrorKind::PeerReset)
        );
        assert_eq!(
            classify_stderr_line("av_interleaved_write_frame(): Broken pipe"),
            Some(StderrErrorKind::PeerReset)
        );
        assert_eq!(
            classify_stderr_line("unexpected EOF while reading"),
            Some(StderrErrorKind::Eof)
        );
    }

    #[test]
    fn classifies_http_status_families() {
        assert_eq!(
            classify_stderr_line("Server returned 404 Not Found"),
            Some(StderrErrorKind::Http4xx)
        );
        assert_eq!(
            classify_stderr_line("Server returned 5XX Server Error reply"),
            Some(StderrErrorKind::Http5xx)
        );
    }

    #[test]
    fn status_family_shadows_auth_per_table_order() {
        // "Server returned 403 Forbidden" matches the 4xx family first;
        // the bare auth phrases only catch lines without the family prefix.
        assert_eq!(
            classify_stderr_line("Server returned 403 Forbidden (access denied)"),
            Some(StderrErrorKind::Http4xx)
        );
        assert_eq!(
            classify_stderr_line("HTTP error 403 Forbidden"),
            Some(StderrErrorKind::Auth)
        );
        assert_eq!(
            classify_stderr_line("response: unauthorized"),
            Some(StderrErrorKind::Auth)
        );
    }

    #[test]
    fn classifies_decoder_and_decryption() {
        assert_eq!(
            classify_stderr_line("non-existing PPS 0 referenced"),
            Some(StderrErrorKind::DecoderCorruption)
        );
        assert_eq!(
            classify_stderr_line("decode_slice_header error"),
            Some(StderrErrorKind::DecoderCorruption)
        );
        assert_eq!(
            classify_stderr_line("Unable to open key file https://k/key"),
            Some(StderrErrorKind::Decryption)
        );
    }

    #[test]
    fn plain_status_lines_produce_no_event() {
        assert_eq!(classify_stderr_line("Opening 'http://x/seg1.ts' for reading"), None);
        assert_eq!(
            classify_stderr_line("Stream #0:0: Video: h264 (Main), yuv420p, 1920x1080"),
            None
        );
        assert_eq!(classify_stderr_line("frame= 1200 fps= 25 q=-1.0"), None);
    }

    #[test]
    fn unmatched_failures_fall_back_to_unknown() {
        assert_eq!(
            classify_stderr_line("Generic mux error occurred"),
            Some(StderrErrorKind::Unknown)
        );
    }
}
