//! # slotwatch: BigQuery slot reservation monitoring
//!
//! `slotwatch` works out how busy each BigQuery slot reservation owned by an admin project is,
//! and alerts chat channels when utilization reaches a threshold.
//!
//! ## Overview
//!
//! A run is triggered by an HTTP request to `/`, typically from a scheduler. The run:
//!
//! 1. Lists the reservations of the admin project in every configured location.
//! 2. Resolves each reservation's assignments into the set of consumer projects, expanding folder
//!    and organization assignees through Resource Manager. Expansions are cached for
//!    `cache.max_age` and shared between runs.
//! 3. Lists the running query jobs of every consumer project and turns their latest timeline
//!    sample into an average slot usage.
//! 4. Sums usage per reservation and flags reservations at or above `threshold`.
//!
//! The resulting [`state::PipelineState`] is returned as JSON, stored as a snapshot when a bucket
//! is configured, and rendered into an alert for the Slack and Google Chat webhooks when any
//! reservation is breached.
//!
//! Upstream failures are contained to the smallest unit that failed: one location, one assignee,
//! one project or one job. Only a failure to reach the reservation service fails the request.
//!
//! ## Configuration
//!
//! See [`config`]. A minimal deployment only needs `GOOGLE_CLOUD_PROJECT`; credentials come from
//! the metadata server of the Cloud Run service or GCE instance.

pub mod alerts;
pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod pipeline;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod upstream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use axum::{Json, Router, extract::State, routing::get};
use bon::Builder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, instrument, warn};

pub use config::Config;

use crate::alerts::{AlertRenderer, WebhookTargets};
use crate::cache::HierarchyCache;
use crate::errors::Result;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::state::PipelineState;
use crate::storage::{S3SnapshotSink, SnapshotSink};
use crate::upstream::google::GoogleClientFactory;

static CRYPTO_PROVIDER: Once = Once::new();

/// Installs the process-wide rustls crypto provider used by every TLS client.
pub fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Err means another provider was installed first, which is fine
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Shared HTTP client for upstream APIs, the metadata server and webhooks.
pub fn http_client() -> anyhow::Result<reqwest::Client> {
    install_crypto_provider();
    Ok(reqwest::Client::builder().user_agent(concat!("slotwatch/", env!("CARGO_PKG_VERSION"))).build()?)
}

/// Application state shared across request handlers.
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub pipeline: Arc<Pipeline>,
    pub renderer: Arc<AlertRenderer>,
    pub http: reqwest::Client,
    pub snapshot_sink: Option<Arc<dyn SnapshotSink>>,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Runs the pipeline once, then persists the result and publishes alerts for breaches.
#[instrument(skip_all)]
pub async fn run_once(state: &AppState) -> Result<PipelineState> {
    let snapshot = match state.pipeline.run().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            crate::metrics::record_run("failed");
            return Err(e);
        }
    };

    if snapshot.is_empty() {
        crate::metrics::record_run("empty");
        return Ok(snapshot);
    }

    crate::metrics::record_state(&snapshot);

    match &state.snapshot_sink {
        Some(sink) => {
            if let Err(e) = sink.store(&snapshot).await {
                warn!(error = %e, "failed to persist snapshot");
            }
        }
        None => debug!("snapshot persistence disabled"),
    }

    if snapshot.any_breached() {
        publish_alert(state, &snapshot).await;
    }

    crate::metrics::record_run("ok");
    Ok(snapshot)
}

async fn publish_alert(state: &AppState, snapshot: &PipelineState) {
    let message = match state.renderer.render(snapshot) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "failed to render alert");
            return;
        }
    };

    let targets = WebhookTargets::resolve(&state.config.alerts.secret_dir);
    let delivered = alerts::dispatch(&state.http, &targets, &message).await;
    info!(delivered, breached = snapshot.breached().count(), "alert published");
}

async fn run_handler(State(state): State<AppState>) -> Result<Json<PipelineState>> {
    run_once(&state).await.map(Json)
}

async fn healthz() -> &'static str {
    "OK"
}

pub fn build_router(state: AppState) -> Router {
    let metrics_handle = state.metrics_handle.clone();

    let mut router = Router::new()
        .route("/", get(run_handler).post(run_handler))
        .route("/healthz", get(healthz))
        .with_state(state);

    if let Some(handle) = metrics_handle {
        router = router.route(
            "/internal/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Builds upstream clients, the hierarchy cache and the optional snapshot sink.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting slotwatch with configuration: {:#?}", config);

        let factory = GoogleClientFactory::new(&config.upstream)?;
        let cache = HierarchyCache::new(config.cache.max_age, config.cache.max_capacity);
        let pipeline = Pipeline::new(Arc::new(factory), cache, PipelineSettings::from(&config));

        let snapshot_sink: Option<Arc<dyn SnapshotSink>> = match S3SnapshotSink::from_config(&config.storage).await {
            Some(sink) => Some(Arc::new(sink)),
            None => {
                info!("no state bucket configured, snapshots will not be stored");
                None
            }
        };

        let state = AppState::builder()
            .config(config.clone())
            .pipeline(Arc::new(pipeline))
            .renderer(Arc::new(AlertRenderer::new(&config.alerts.template)))
            .http(http_client()?)
            .maybe_snapshot_sink(snapshot_sink)
            .maybe_metrics_handle(config.enable_metrics.then(crate::metrics::install_recorder))
            .build();

        Ok(Self::from_state(state))
    }

    pub fn from_state(state: AppState) -> Self {
        let config = state.config.clone();
        Self {
            router: build_router(state),
            config,
        }
    }

    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("slotwatch listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
