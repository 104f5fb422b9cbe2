//! Web layer
//!
//! Thin HTTP surface over the streaming engine. Handlers extract request
//! facts and delegate; shared services are injected through `AppState`
//! rather than process-wide singletons, so tests can stand up isolated
//! planes.

use anyhow::Result;
use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::catalog::ChannelCatalog;
use crate::config::Config;
use crate::streaming::client_class::ClientClassifier;
use crate::streaming::preview::PreviewTranscoder;
use crate::streaming::registry::{RegistryConfig, SessionRegistry};
use crate::streaming::resolver::UpstreamResolver;
use crate::streaming::segments::SegmentResolver;
use crate::streaming::session::StreamingEngine;
use crate::streaming::supervisor::{Supervisor, SupervisorConfig};

pub mod handlers;
pub mod responses;

/// Shared handler state; everything is an `Arc`, cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<StreamingEngine>,
    pub preview: Arc<PreviewTranscoder>,
    pub segments: Arc<SegmentResolver>,
    pub classifier: Arc<ClientClassifier>,
}

impl AppState {
    /// Wire the full streaming plane from configuration plus a catalog.
    pub fn build(config: Config, catalog: Arc<dyn ChannelCatalog>) -> Result<Self> {
        let config = Arc::new(config);

        let client = reqwest::Client::builder()
            .connect_timeout(config.upstream.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(
                config.upstream.max_redirect_hops,
            ))
            .user_agent(config.web.user_agent.clone())
            .build()?;

        let registry = SessionRegistry::new(
            RegistryConfig {
                max_tuner_sessions: config.streaming.max_concurrent_streams,
                max_preview_sessions: config.streaming.max_concurrent_previews,
                audit_grace: config.streaming.audit_grace,
                stall_deadline: config.streaming.stall_deadline,
            },
            catalog.clone(),
        );

        let resolver = UpstreamResolver::new(client.clone(), config.upstream.clone());
        let segments = SegmentResolver::new(client, config.upstream.clone());

        let supervisor = Supervisor::new(SupervisorConfig {
            command: config.streaming.transcoder_command.clone(),
            chunk_bytes: config.streaming.chunk_bytes,
            hls_protocol_args: config.streaming.hls_protocol_args.clone(),
        });

        let engine = StreamingEngine::new(
            config.clone(),
            registry,
            resolver,
            catalog,
            supervisor,
        );
        let preview = Arc::new(PreviewTranscoder::new(engine.clone()));
        let classifier = Arc::new(ClientClassifier::new(config.effective_class_rules()));

        Ok(Self {
            config,
            engine,
            preview,
            segments,
            classifier,
        })
    }
}

/// Build the router. Preview routes carry the permissive CORS layer;
/// tuner routes never do.
pub fn create_router(state: AppState) -> Router {
    let preview_routes = Router::new()
        .route(
            "/streams/preview/{stream_id}",
            get(handlers::streams::preview_stream),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    Router::new()
        .route("/stream/{id}", get(handlers::streams::tuner_stream))
        .route(
            "/stream/{id}/{segment}",
            get(handlers::streams::stream_segment),
        )
        .route("/streams/active", get(handlers::streams::active_sessions))
        .merge(preview_routes)
        .with_state(state)
}

/// Web server wrapper: bind, serve, drain sessions on shutdown.
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", state.config.web.host, state.config.web.port)
            .parse()?;
        let registry = state.engine.registry.clone();
        Ok(Self {
            app: create_router(state),
            addr,
            registry,
        })
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "tuner-bridge listening");

        let registry = self.registry;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("shutdown signal received, draining sessions");
                let snapshots = registry.snapshot().await;
                for snapshot in snapshots {
                    if !snapshot.state.is_terminal() {
                        registry.close(snapshot.session_id, "shutdown").await;
                    }
                }
            })
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
