//! Client classification
//!
//! One entry point turns an incoming request's User-Agent, headers and
//! query parameters into a coarse client class plus the streaming
//! defaults that class implies: which transcode template runs, how the
//! subscriber joins the fan-out hub, what happens when it lags, and
//! whether the resilience ladder is armed.
//!
//! Matching is ordered and first-match-wins over case-insensitive UA
//! substrings; header and query heuristics only run when no UA rule hit.

use crate::config::{ClientClassRule, TemplateKind};
use crate::models::ClientClass;
use crate::streaming::fanout::{JoinPolicy, LagPolicy};

/// The classification outcome driving a request's streaming defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: ClientClass,
    pub template: TemplateKind,
    pub resilience: bool,
    pub join: JoinPolicy,
    pub lag: LagPolicy,
    /// Whether HEAD answers 200 without creating a session
    pub head_without_session: bool,
}

/// The request facts classification reads.
#[derive(Debug, Default, Clone)]
pub struct ClassificationInput<'a> {
    pub user_agent: Option<&'a str>,
    pub accept: Option<&'a str>,
    /// Any `X-Plex-*` style tuner-server header present
    pub has_tuner_server_header: bool,
    /// Explicit `class=` query override
    pub query_class: Option<&'a str>,
    /// `transcode=true|false` query override
    pub query_transcode: Option<bool>,
}

pub struct ClientClassifier {
    rules: Vec<ClientClassRule>,
}

impl ClientClassifier {
    pub fn new(rules: Vec<ClientClassRule>) -> Self {
        Self { rules }
    }

    pub fn classify(&self, input: &ClassificationInput<'_>) -> Classification {
        // Explicit query override beats everything.
        if let Some(class) = input.query_class.and_then(|v| v.parse::<ClientClass>().ok()) {
            return self.apply_overrides(Self::defaults_for(class), input);
        }

        // Ordered UA substring rules.
        if let Some(agent) = input.user_agent {
            let lower = agent.to_lowercase();
            for rule in &self.rules {
                if lower.contains(&rule.substring.to_lowercase()) {
                    let mut classification = Self::defaults_for(rule.class);
                    classification.template = rule.template;
                    classification.resilience = rule.resilience;
                    return self.apply_overrides(classification, input);
                }
            }
        }

        // Header heuristics.
        if input.has_tuner_server_header {
            return self.apply_overrides(Self::defaults_for(ClientClass::TunerServer), input);
        }
        if let Some(accept) = input.accept {
            if accept.contains("text/html") {
                return self.apply_overrides(Self::defaults_for(ClientClass::WebBrowser), input);
            }
        }

        // Unknown clients get the generic player profile.
        self.apply_overrides(Self::defaults_for(ClientClass::ExternalPlayer), input)
    }

    fn apply_overrides(
        &self,
        mut classification: Classification,
        input: &ClassificationInput<'_>,
    ) -> Classification {
        match input.query_transcode {
            Some(true) => {
                if classification.template == TemplateKind::MpegtsCopy {
                    classification.template = TemplateKind::MpegtsReencode;
                }
            }
            Some(false) => {
                if classification.template == TemplateKind::MpegtsReencode {
                    classification.template = TemplateKind::MpegtsCopy;
                }
            }
            None => {}
        }
        classification
    }

    /// Per-class streaming defaults. Rules override template/resilience;
    /// join and lag policy follow from what the class can tolerate.
    fn defaults_for(class: ClientClass) -> Classification {
        match class {
            ClientClass::TunerServer => Classification {
                class,
                template: TemplateKind::MpegtsCopy,
                resilience: true,
                join: JoinPolicy::Replay,
                lag: LagPolicy::Sever,
                head_without_session: true,
            },
            ClientClass::TunerClientLivingRoomDevice => Classification {
                class,
                template: TemplateKind::MpegtsCopy,
                resilience: true,
                join: JoinPolicy::Replay,
                lag: LagPolicy::Sever,
                head_without_session: true,
            },
            ClientClass::WebBrowser => Classification {
                class,
                template: TemplateKind::PreviewMp4,
                resilience: false,
                join: JoinPolicy::Live,
                lag: LagPolicy::SkipToLive,
                head_without_session: false,
            },
            ClientClass::ExternalPlayer => Classification {
                class,
                template: TemplateKind::MpegtsCopy,
                resilience: true,
                join: JoinPolicy::Live,
                lag: LagPolicy::Sever,
                head_without_session: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ClientClassifier {
        ClientClassifier::new(ClientClassRule::builtin_rules())
    }

    #[test]
    fn media_server_agents_are_tuner_servers() {
        let classifier = classifier();
        for agent in ["PlexMediaServer/1.40.0", "Jellyfin-Server/10.9", "Emby/4.8"] {
            let result = classifier.classify(&ClassificationInput {
                user_agent: Some(agent),
                ..Default::default()
            });
            assert_eq!(result.class, ClientClass::TunerServer, "agent {agent}");
            assert!(result.resilience);
            assert!(result.head_without_session);
            assert_eq!(result.join, JoinPolicy::Replay);
        }
    }

    #[test]
    fn browsers_get_preview_defaults() {
        let result = classifier().classify(&ClassificationInput {
            user_agent: Some("Mozilla/5.0 (Macintosh) AppleWebKit/605.1.15"),
            ..Default::default()
        });
        assert_eq!(result.class, ClientClass::WebBrowser);
        assert_eq!(result.template, TemplateKind::PreviewMp4);
        assert!(!result.resilience);
        assert_eq!(result.lag, LagPolicy::SkipToLive);
    }

    #[test]
    fn players_do_not_arm_resilience_when_rule_says_so() {
        let result = classifier().classify(&ClassificationInput {
            user_agent: Some("VLC/3.0.18 LibVLC/3.0.18"),
            ..Default::default()
        });
        assert_eq!(result.class, ClientClass::ExternalPlayer);
        assert!(!result.resilience);
    }

    #[test]
    fn rule_order_is_first_match_wins() {
        let rules = vec![
            ClientClassRule {
                substring: "special".into(),
                class: ClientClass::WebBrowser,
                template: TemplateKind::PreviewMp4,
                resilience: false,
            },
            ClientClassRule {
                substring: "spec".into(),
                class: ClientClass::TunerServer,
                template: TemplateKind::MpegtsCopy,
                resilience: true,
            },
        ];
        let classifier = ClientClassifier::new(rules);
        let result = classifier.classify(&ClassificationInput {
            user_agent: Some("my-special-client/1.0"),
            ..Default::default()
        });
        assert_eq!(result.class, ClientClass::WebBrowser);
    }

    #[test]
    fn header_heuristics_apply_without_ua_match() {
        let classifier = classifier();

        let tuner = classifier.classify(&ClassificationInput {
            user_agent: Some("SomethingUnknown/0.1"),
            has_tuner_server_header: true,
            ..Default::default()
        });
        assert_eq!(tuner.class, ClientClass::TunerServer);

        let browser = classifier.classify(&ClassificationInput {
            user_agent: None,
            accept: Some("text/html,application/xhtml+xml"),
            ..Default::default()
        });
        assert_eq!(browser.class, ClientClass::WebBrowser);
    }

    #[test]
    fn query_class_override_beats_ua() {
        let result = classifier().classify(&ClassificationInput {
            user_agent: Some("PlexMediaServer/1.40.0"),
            query_class: Some("web_browser"),
            ..Default::default()
        });
        assert_eq!(result.class, ClientClass::WebBrowser);
    }

    #[test]
    fn transcode_override_flips_template() {
        let forced = classifier().classify(&ClassificationInput {
            user_agent: Some("PlexMediaServer/1.40.0"),
            query_transcode: Some(true),
            ..Default::default()
        });
        assert_eq!(forced.template, TemplateKind::MpegtsReencode);

        let disabled = classifier().classify(&ClassificationInput {
            user_agent: Some("Roku/DVP-12.0"),
            query_transcode: Some(false),
            ..Default::default()
        });
        assert_eq!(disabled.template, TemplateKind::MpegtsCopy);
    }

    #[test]
    fn unknown_clients_fall_back_to_external_player() {
        let result = classifier().classify(&ClassificationInput {
            user_agent: Some("curl/8.4.0"),
            ..Default::default()
        });
        assert_eq!(result.class, ClientClass::ExternalPlayer);
        assert_eq!(result.join, JoinPolicy::Live);
    }
}
