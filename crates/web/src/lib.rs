mod handlers;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{Request, StatusCode, header},
};
use deployer_core::config::Config;
use deployer_github::{GitHub, WorkflowDispatcher};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

/// Environment variable holding the config file path.
pub const CONFIG_PATH_ENV: &str = "DEPLOYER_CONFIG";

/// Which of the two services to run. They share everything but the request
/// body accepted by `POST /v1/deploy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Deployer,
    Repeater,
}

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    dispatcher: Arc<WorkflowDispatcher<GitHub>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, github: GitHub) -> Self {
        let dispatcher = Arc::new(WorkflowDispatcher::new(github, config.dispatch.clone()));
        Self { config, dispatcher }
    }
}

/// Logs to stdout, filtered by `RUST_LOG` and falling back to `info`.
fn init_tracing() {
    let env_filter =
        EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();
}

pub async fn run(service: Service) -> Result<()> {
    init_tracing();

    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.yml".to_string());
    let config = Arc::new(Config::load(&config_path)?);
    let github = GitHub::new(&config.github)?;
    if let Err(e) = github.check_login().await {
        tracing::warn!("{:?}", e);
    }
    let state = AppState::new(config.clone(), github);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    let listener = TcpListener::bind(addr).await.context("bind error")?;
    tracing::info!("{:?}: Listening on {}", service, addr);

    let router = app(state, service).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Web server error")?;
    tracing::info!("Shut down gracefully");
    Ok(())
}

pub fn app(state: AppState, service: Service) -> Router {
    let sensitive_headers: Arc<[_]> = vec![header::AUTHORIZATION, header::COOKIE].into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(RequestSpan)
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(state.config.server.request_timeout_secs),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash());
    build_router(service).with_state(state).layer(middleware)
}

/// Resolves on ctrl-c, or SIGTERM on unix, so in-flight deploys can finish.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
        }
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

/// Peer address of the connection. Forwarding headers are client-controlled
/// and never consulted.
fn client_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    request.extensions().get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip())
}

/// Opens an info-level `request` span per inbound request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            ip = client_ip(request).map(tracing::field::display),
            user_agent = %user_agent,
        )
    }
}
