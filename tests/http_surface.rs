//! Router-level tests for the HTTP surface
//!
//! Exercises the real router with `sh`-based fake transcoders. The
//! classification table gets a test rule so the tuner-path tests can run
//! without the resilience ladder keeping responses open forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use axum_test::TestServer;
use tuner_bridge::catalog::MemoryCatalog;
use tuner_bridge::config::{ClientClassRule, Config, TemplateKind};
use tuner_bridge::models::{Channel, ClientClass, Stream, StreamProtocol};
use tuner_bridge::web::{AppState, create_router};

fn sh_template(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string(), "[URL]".to_string()]
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.streaming.transcoder_command = "sh".to_string();
    config.streaming.transcode_template.mpegts_copy =
        sh_template("printf ts-a; sleep 0.4; printf ts-b");
    config.streaming.transcode_template.mpegts_reencode =
        sh_template("printf ts-a; sleep 0.4; printf ts-b");
    config.streaming.transcode_template.preview_mp4 =
        sh_template("printf mp4-a; sleep 0.4; printf mp4-b");
    config.streaming.startup_deadline = Duration::from_secs(5);
    config.streaming.stop_grace = Duration::from_millis(200);
    config.streaming.drain_deadline = Duration::from_secs(2);
    // Tuner-class test clients without the resilience ladder, so finite
    // scripts end the response body.
    config.client_class_rules = vec![
        ClientClassRule {
            substring: "testtuner".into(),
            class: ClientClass::TunerServer,
            template: TemplateKind::MpegtsCopy,
            resilience: false,
        },
        ClientClassRule {
            substring: "mozilla".into(),
            class: ClientClass::WebBrowser,
            template: TemplateKind::PreviewMp4,
            resilience: false,
        },
    ];
    config
}

async fn seeded_state(config: Config) -> (AppState, Channel, Stream) {
    let catalog = MemoryCatalog::new();
    let channel = Channel {
        id: Uuid::new_v4(),
        number: 101,
        name: "Test One".into(),
        enabled: true,
        logo_url: None,
        guide_key: None,
    };
    let stream = Stream {
        id: Uuid::new_v4(),
        channel_id: channel.id,
        url: "http://upstream.invalid/feed.ts".into(),
        backup_urls: vec![],
        protocol: StreamProtocol::Ts,
        username: None,
        password: None,
        request_headers: HashMap::new(),
        protocol_options: HashMap::new(),
        enabled: true,
    };
    catalog.insert_channel(channel.clone()).await.unwrap();
    catalog.insert_stream(stream.clone()).await.unwrap();
    let state = AppState::build(config, catalog).unwrap();
    (state, channel, stream)
}

#[tokio::test(flavor = "multi_thread")]
async fn head_answers_without_creating_a_session() {
    let (state, _, _) = seeded_state(test_config()).await;
    let server = TestServer::new(create_router(state.clone())).unwrap();

    let response = server
        .method(axum::http::Method::HEAD, "/stream/101")
        .add_header("user-agent", "testtuner/1.0")
        .await;

    response.assert_status_ok();
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "video/mp2t"
    );

    let sessions = state.engine.registry.snapshot().await;
    assert!(sessions.is_empty(), "HEAD must not create a session");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_channel_is_404() {
    let (state, _, _) = seeded_state(test_config()).await;
    let server = TestServer::new(create_router(state)).unwrap();

    let response = server
        .get("/stream/999")
        .add_header("user-agent", "testtuner/1.0")
        .await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);

    // Per the tuner-path contract the body is empty.
    assert!(response.as_bytes().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn tuner_get_streams_mpegts_with_mandatory_header() {
    let (state, _, _) = seeded_state(test_config()).await;
    let server = TestServer::new(create_router(state.clone())).unwrap();

    let response = server
        .get("/stream/101")
        .add_header("user-agent", "testtuner/1.0")
        .await;

    response.assert_status_ok();
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "video/mp2t"
    );
    let body = response.as_bytes();
    let text = String::from_utf8_lossy(body);
    assert!(text.contains("ts-a"));
    assert!(text.contains("ts-b"));
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_exhaustion_maps_to_503() {
    let mut config = test_config();
    config.streaming.max_concurrent_streams = 0;
    let (state, _, _) = seeded_state(config).await;
    let server = TestServer::new(create_router(state)).unwrap();

    let response = server
        .get("/stream/101")
        .add_header("user-agent", "testtuner/1.0")
        .await;
    response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(flavor = "multi_thread")]
async fn preview_serves_mp4_with_cors() {
    let (state, _, stream) = seeded_state(test_config()).await;
    let server = TestServer::new(create_router(state)).unwrap();

    let response = server
        .get(&format!("/streams/preview/{}", stream.id))
        .add_header("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")
        .await;

    response.assert_status_ok();
    assert_eq!(response.headers().get("content-type").unwrap(), "video/mp4");
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
    let text = String::from_utf8_lossy(response.as_bytes()).to_string();
    assert!(text.contains("mp4-"));
}

#[tokio::test(flavor = "multi_thread")]
async fn preview_unknown_stream_is_json_404() {
    let (state, _, _) = seeded_state(test_config()).await;
    let server = TestServer::new(create_router(state)).unwrap();

    let response = server
        .get(&format!("/streams/preview/{}", Uuid::new_v4()))
        .add_header("user-agent", "Mozilla/5.0")
        .await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);

    let body: serde_json::Value = response.json();
    assert_eq!(body["kind"], "not_found");
    assert!(body["detail"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn active_sessions_reports_capacity() {
    let (state, _, _) = seeded_state(test_config()).await;
    let max = state.config.streaming.max_concurrent_streams;
    let server = TestServer::new(create_router(state)).unwrap();

    let response = server.get("/streams/active").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert!(body["sessions"].as_array().unwrap().is_empty());
    assert_eq!(body["capacity"]["current"], 0);
    assert_eq!(body["capacity"]["max"], max as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn tuner_path_has_no_cors_header() {
    let (state, _, _) = seeded_state(test_config()).await;
    let server = TestServer::new(create_router(state)).unwrap();

    let response = server
        .get("/stream/101")
        .add_header("user-agent", "testtuner/1.0")
        .await;
    response.assert_status_ok();
    assert!(
        response
            .headers()
            .get("access-control-allow-origin")
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_lookup_accepts_stream_uuid() {
    let (state, _, stream) = seeded_state(test_config()).await;
    let server = TestServer::new(create_router(state)).unwrap();

    let response = server
        .get(&format!("/stream/{}", stream.id))
        .add_header("user-agent", "testtuner/1.0")
        .await;
    response.assert_status_ok();
}
