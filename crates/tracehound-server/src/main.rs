mod config;
mod error;
mod handlers;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracehound_core::now_ms;
use tracehound_monitor::{with_store, RecorderConfig, TraceRecorder, TraceStore};
use tracing::{info, warn};

use crate::config::ServerConfig;

const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub struct ServerState {
    pub store: Arc<TraceStore>,
    pub recorder: TraceRecorder,
}

impl ServerState {
    pub fn new(store: Arc<TraceStore>, config: RecorderConfig) -> Self {
        Self {
            recorder: TraceRecorder::new(Arc::clone(&store), config),
            store,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = ServerConfig::from_env()?;
    let store = Arc::new(TraceStore::new(&config.db_path)?);

    if let Some(days) = config.retention_days {
        spawn_retention(Arc::clone(&store), days);
    }

    let recorder_config = RecorderConfig::new().with_default_project(config.default_project.clone());
    let state = Arc::new(ServerState::new(store, recorder_config));

    info!("Starting server on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
            )
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            info!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    let api_routes = Router::new()
        .route("/api/traces", get(handlers::traces::list))
        .route(
            "/api/traces/{id}",
            get(handlers::traces::get).delete(handlers::traces::delete),
        )
        .route("/api/summary", get(handlers::traces::summary))
        .layer(trace_layer);

    Router::new()
        .merge(api_routes)
        .route("/ingest", get(ws::ingest_handler))
        .route("/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}

/// Purges traces older than `days` every hour.
fn spawn_retention(store: Arc<TraceStore>, days: u32) {
    let max_age_ms = i64::from(days) * DAY_MS;
    info!(days, "Trace retention enabled");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            ticker.tick().await;
            let cutoff = now_ms() - max_age_ms;
            if let Err(e) = with_store(&store, move |s| s.purge_traces_before(cutoff)).await {
                warn!("Retention purge failed: {}", e);
            }
        }
    });
}
