//! HTTP surface: `POST /api/check` and `GET /healthz`.
//!
//! A check request is validated, then run through the executor. The
//! `Accept` header picks the response shape: `text/event-stream` gets the
//! SSE stream from [`stream`], anything else a single JSON body.

pub mod handlers;
pub mod stream;

use crate::config::Config;
use crate::executor::PipelineExecutor;
use crate::merge::MergeConfig;
use crate::types::PipelineEntry;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Request-correlation header, echoed on every response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request limits and defaults.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub request_timeout: Duration,
    pub heartbeat: Duration,
    /// Longest accepted text, in UTF-16 code units.
    pub max_text_chars: usize,
    pub merge: MergeConfig,
    pub default_pipeline: Vec<PipelineEntry>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            heartbeat: config.heartbeat(),
            max_text_chars: config.max_text_chars,
            merge: config.merge_config(),
            default_pipeline: config.default_pipeline.clone(),
        }
    }
}

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub executor: PipelineExecutor,
    pub settings: Arc<ServerSettings>,
}

impl AppState {
    pub fn new(executor: PipelineExecutor, settings: ServerSettings) -> Self {
        Self {
            executor,
            settings: Arc::new(settings),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)]);

    Router::new()
        .route("/api/check", post(handlers::check))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
