//! Preview transcoder
//!
//! Short-lived, capacity-capped transcode sessions for web-browser
//! previews. Same supervisor and fan-out machinery as the tuner path, but
//! wired with the browser-playable fMP4 template, a separate (smaller)
//! concurrency pool, a short idle timeout, and no resilience ladder —
//! preview failures surface directly on the HTTP response.

use std::sync::Arc;
use std::time::Duration;

use crate::config::TemplateKind;
use crate::errors::StreamingResult;
use crate::models::{ClientClass, Stream};
use crate::streaming::client_class::Classification;
use crate::streaming::fanout::{JoinPolicy, LagPolicy, Subscription};
use crate::streaming::registry::{ClientIdentity, SessionKind, SessionRecord};
use crate::streaming::resolver::QualityPreference;
use crate::streaming::session::StreamingEngine;

/// Options carried on the preview query string.
#[derive(Debug, Clone, Default)]
pub struct PreviewOptions {
    pub quality: Option<QualityPreference>,
    /// `transcode=false` serves the upstream bytes copy-muxed instead
    pub transcode: Option<bool>,
    /// `timeout=<ms>` overrides the idle timeout for this session
    pub timeout: Option<Duration>,
}

pub struct PreviewTranscoder {
    engine: Arc<StreamingEngine>,
}

impl PreviewTranscoder {
    pub fn new(engine: Arc<StreamingEngine>) -> Self {
        Self { engine }
    }

    /// Open a preview session and attach the requesting client. Capacity
    /// is enforced by the registry's preview pool; a full pool maps to
    /// 503 on the surface.
    pub async fn open(
        &self,
        stream: Stream,
        identity: ClientIdentity,
        class: ClientClass,
        options: PreviewOptions,
    ) -> StreamingResult<(Arc<SessionRecord>, Subscription)> {
        // External players consume the transport stream directly unless
        // transcoding is explicitly requested; browsers always get fMP4.
        let template = match (class, options.transcode) {
            (_, Some(false)) => TemplateKind::MpegtsCopy,
            (ClientClass::ExternalPlayer, None) => TemplateKind::MpegtsCopy,
            _ => TemplateKind::PreviewMp4,
        };
        let classification = Classification {
            class,
            template,
            resilience: false,
            join: JoinPolicy::Live,
            lag: LagPolicy::SkipToLive,
            head_without_session: false,
        };
        let idle = options
            .timeout
            .unwrap_or(self.engine.config.streaming.preview_idle_timeout);

        let record = self
            .engine
            .open_session(
                stream.channel_id,
                stream,
                SessionKind::Preview,
                identity,
                classification,
                options.quality.unwrap_or_default(),
                None,
                idle,
            )
            .await?;

        let subscription = self
            .engine
            .subscribe(&record, JoinPolicy::Live, LagPolicy::SkipToLive)
            .await?;

        Ok((record, subscription))
    }

    /// The response content type for a preview: browsers get fragmented
    /// MP4, external players get the transport stream directly.
    pub fn content_type(class: ClientClass, transcode: Option<bool>) -> &'static str {
        match (class, transcode) {
            (_, Some(true)) => "video/mp4",
            (_, Some(false)) => "video/mp2t",
            (ClientClass::ExternalPlayer, None) => "video/mp2t",
            _ => "video/mp4",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_follows_class_and_transcode_flag() {
        assert_eq!(
            PreviewTranscoder::content_type(ClientClass::WebBrowser, None),
            "video/mp4"
        );
        assert_eq!(
            PreviewTranscoder::content_type(ClientClass::ExternalPlayer, None),
            "video/mp2t"
        );
        assert_eq!(
            PreviewTranscoder::content_type(ClientClass::ExternalPlayer, Some(true)),
            "video/mp4"
        );
        assert_eq!(
            PreviewTranscoder::content_type(ClientClass::WebBrowser, Some(false)),
            "video/mp2t"
        );
    }
}
