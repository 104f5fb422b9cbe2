//! Property-based tests for the streaming plane's universal laws

use proptest::prelude::*;
use uuid::Uuid;

use tuner_bridge::catalog::MemoryCatalog;
use tuner_bridge::config::{ClientClassRule, ResilienceConfig};
use tuner_bridge::models::ClientClass;
use tuner_bridge::streaming::client_class::{ClassificationInput, ClientClassifier};
use tuner_bridge::streaming::fanout::{FanoutConfig, FanoutHub, JoinPolicy, LagPolicy};
use tuner_bridge::streaming::registry::{
    ClientIdentity, RegistryConfig, SessionKind, SessionRegistry,
};
use tuner_bridge::streaming::resilience::{
    RecoveryAction, RecoveryTrigger, ResilienceController,
};
use tuner_bridge::streaming::resolver::{HlsVariant, QualityPreference, select_variant};
use tuner_bridge::streaming::segments::find_segment;
use tuner_bridge::streaming::stderr_classifier::{StderrErrorKind, classify_stderr_line};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    /// No lost bytes: a subscriber that keeps up observes exactly the
    /// producer's output, in order, as a contiguous sequence.
    #[test]
    fn fanout_delivers_contiguous_producer_output(
        chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..64),
            1..40,
        )
    ) {
        runtime().block_on(async {
            let hub = FanoutHub::new(FanoutConfig { capacity_bytes: 1 << 20 });
            let mut sub = hub.subscribe(JoinPolicy::Replay, LagPolicy::Sever).await;

            let mut expected = Vec::new();
            for chunk in &chunks {
                expected.extend_from_slice(chunk);
                hub.publish(bytes::Bytes::copy_from_slice(chunk)).await;
            }
            hub.close().await;

            let mut observed = Vec::new();
            while let Some(item) = sub.recv().await {
                observed.extend_from_slice(&item.expect("keep-up subscriber must not lag out"));
            }
            prop_assert_eq!(observed, expected);
            Ok(())
        })?;
    }

    /// Byte accounting: total_bytes_in equals the sum of published chunk
    /// sizes regardless of ring eviction.
    #[test]
    fn fanout_accounts_every_published_byte(
        sizes in proptest::collection::vec(1usize..512, 1..50),
        capacity in 64usize..4096,
    ) {
        runtime().block_on(async {
            let hub = FanoutHub::new(FanoutConfig { capacity_bytes: capacity });
            let mut total = 0u64;
            for size in &sizes {
                total += *size as u64;
                hub.publish(bytes::Bytes::from(vec![0u8; *size])).await;
            }
            prop_assert_eq!(hub.total_bytes_in(), total);
            Ok(())
        })?;
    }

    /// Session uniqueness: N opens produce N distinct session ids with
    /// pairwise-disjoint consumer id sets.
    #[test]
    fn sessions_have_unique_ids_and_disjoint_aliases(count in 1usize..12) {
        runtime().block_on(async {
            let registry = SessionRegistry::new(
                RegistryConfig {
                    max_tuner_sessions: 64,
                    ..Default::default()
                },
                MemoryCatalog::new(),
            );

            let mut ids = Vec::new();
            for i in 0..count {
                let record = registry
                    .open(
                        Uuid::new_v4(),
                        SessionKind::Tuner,
                        ClientIdentity {
                            ip: format!("10.0.0.{i}"),
                            user_agent: None,
                        },
                        ClientClass::TunerServer,
                        "http://u/live.ts".into(),
                        Some(format!("alias-{i}")),
                    )
                    .await
                    .unwrap();
                ids.push(record.session_id);
            }

            let unique: std::collections::HashSet<_> = ids.iter().collect();
            prop_assert_eq!(unique.len(), ids.len());

            let snapshots = registry.snapshot().await;
            let mut seen_aliases = std::collections::HashSet::new();
            for snapshot in snapshots {
                for alias in snapshot.consumer_ids {
                    prop_assert!(seen_aliases.insert(alias), "alias bound to two sessions");
                }
            }
            Ok(())
        })?;
    }

    /// Variant selection laws: lowest ≤ medium ≤ highest bandwidth, and
    /// every preference picks an existing variant.
    #[test]
    fn variant_selection_is_ordered_by_bandwidth(
        bandwidths in proptest::collection::vec(1u64..100_000_000, 1..10)
    ) {
        let variants: Vec<HlsVariant> = bandwidths
            .iter()
            .enumerate()
            .map(|(i, bw)| HlsVariant {
                bandwidth: *bw,
                resolution: None,
                codecs: None,
                uri: format!("v{i}/playlist.m3u8"),
            })
            .collect();

        let lowest = select_variant(&variants, QualityPreference::Lowest).unwrap();
        let medium = select_variant(&variants, QualityPreference::Medium).unwrap();
        let highest = select_variant(&variants, QualityPreference::Highest).unwrap();

        prop_assert!(lowest.bandwidth <= medium.bandwidth);
        prop_assert!(medium.bandwidth <= highest.bandwidth);
        prop_assert_eq!(lowest.bandwidth, bandwidths.iter().copied().min().unwrap());
        prop_assert_eq!(highest.bandwidth, bandwidths.iter().copied().max().unwrap());
        prop_assert!(variants.iter().any(|v| v.uri == medium.uri));
    }

    /// Segment lookup is deterministic: same playlist + filename always
    /// resolves to the same entry, and exact matches beat basename ones.
    #[test]
    fn segment_lookup_is_stable(names in proptest::collection::vec("[a-z]{1,8}\\.ts", 1..20)) {
        let first = find_segment(&names, &names[0]).cloned();
        let second = find_segment(&names, &names[0]).cloned();
        prop_assert_eq!(first.clone(), second);
        prop_assert_eq!(first, Some(names[0].clone()));
    }

    /// The classifier is total: any UA string yields a class, and a
    /// string containing a rule substring yields that rule's class when
    /// no earlier rule matches.
    #[test]
    fn classification_is_total_and_rule_driven(agent in "[ -~]{0,64}") {
        let classifier = ClientClassifier::new(ClientClassRule::builtin_rules());
        let _ = classifier.classify(&ClassificationInput {
            user_agent: Some(&agent),
            ..Default::default()
        });

        let prefixed = format!("plex-{agent}");
        let result = classifier.classify(&ClassificationInput {
            user_agent: Some(&prefixed),
            ..Default::default()
        });
        prop_assert_eq!(result.class, ClientClass::TunerServer);
    }

    /// Stderr classification is stable under case changes.
    #[test]
    fn stderr_classification_is_case_insensitive(
        line in proptest::sample::select(vec![
            "Connection timed out",
            "Server returned 404 Not Found",
            "Server returned 5XX Server Error reply",
            "Connection reset by peer",
            "unexpected EOF",
            "unauthorized access",
            "non-existing PPS 0 referenced",
            "Unable to open key file",
        ])
    ) {
        let lower = classify_stderr_line(&line.to_lowercase());
        let upper = classify_stderr_line(&line.to_uppercase());
        let original = classify_stderr_line(line);
        prop_assert_eq!(lower, original);
        prop_assert_eq!(upper, original);
        prop_assert!(original.is_some());
    }

    /// Ladder boundary law: with thresholds (n1, n2, n3), transient
    /// failures produce exactly n1 reconnects, then n2 renewals, then n3
    /// recreates, then Fail — in that order.
    #[test]
    fn ladder_layer_counts_match_thresholds(n1 in 0u32..5, n2 in 0u32..4, n3 in 0u32..3) {
        let mut controller = ResilienceController::new(ResilienceConfig {
            n1,
            n2,
            n3,
            ..Default::default()
        });

        let mut actions = Vec::new();
        for _ in 0..(n1 + n2 + n3 + 2) {
            actions.push(controller.on_failure(RecoveryTrigger::Classified(
                StderrErrorKind::NetworkTimeout,
            )));
        }

        let reconnects = actions
            .iter()
            .filter(|a| matches!(a, RecoveryAction::Reconnect { .. }))
            .count() as u32;
        let renewals = actions
            .iter()
            .filter(|a| matches!(a, RecoveryAction::RestartWithRenewal { .. }))
            .count() as u32;
        let recreates = actions
            .iter()
            .filter(|a| matches!(a, RecoveryAction::RecreateSession { .. }))
            .count() as u32;
        let failures = actions
            .iter()
            .filter(|a| matches!(a, RecoveryAction::Fail))
            .count() as u32;

        prop_assert_eq!(reconnects, n1);
        prop_assert_eq!(renewals, n2);
        prop_assert_eq!(recreates, n3);
        prop_assert_eq!(failures, 2);
    }
}

/// TouchActivity idempotence within clock resolution: repeated touches
/// never move the activity clock backwards.
#[tokio::test]
async fn touch_activity_is_monotone_under_repetition() {
    let registry = SessionRegistry::new(RegistryConfig::default(), MemoryCatalog::new());
    let record = registry
        .open(
            Uuid::new_v4(),
            SessionKind::Tuner,
            ClientIdentity {
                ip: "10.0.0.1".into(),
                user_agent: None,
            },
            ClientClass::TunerServer,
            "http://u/live.ts".into(),
            None,
        )
        .await
        .unwrap();

    let mut last = record.last_activity_at().await;
    for _ in 0..50 {
        record
            .touch_activity(tuner_bridge::streaming::registry::ActivityKind::KeepAlive)
            .await;
        let now = record.last_activity_at().await;
        assert!(now >= last);
        last = now;
    }
}
