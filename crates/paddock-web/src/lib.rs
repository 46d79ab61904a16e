//! Axum admin API over the auto-updater.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Days;
use paddock_core::{parse_race_date, RaceDate, DATE_FORMAT};
use paddock_sync::{
    build_updater, connect_pool, maybe_build_scheduler, run_migrations, AutoUpdater, IngestError,
    PaddockConfig, ScrapeError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "paddock-web";

const DEFAULT_GAP_WINDOW_DAYS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub updater: Arc<AutoUpdater>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    pub fn new(updater: Arc<AutoUpdater>) -> Self {
        Self {
            updater,
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Wait for every backfill started through the API.
    pub async fn join_background(&self) {
        let handles = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "background backfill task panicked");
            }
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/admin/scrape/date", post(scrape_date_handler))
        .route("/api/v1/admin/scrape/yesterday", post(scrape_yesterday_handler))
        .route("/api/v1/admin/backfill", post(backfill_handler))
        .route("/api/v1/admin/status", get(status_handler))
        .route("/api/v1/admin/gaps", get(gaps_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the admin server until ctrl-c/SIGTERM, then drain ingestion work.
pub async fn serve(config: PaddockConfig) -> anyhow::Result<()> {
    let pool = connect_pool(&config).await?;
    run_migrations(&pool).await?;
    let updater = build_updater(&config, pool)?;
    let state = AppState::new(Arc::clone(&updater));

    let startup = config
        .auto_update_on_startup
        .then(|| updater.spawn_on_startup());
    let mut scheduler = maybe_build_scheduler(&updater, config.auto_update_cron.as_deref()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = ?config.auto_update_cron, "scheduled backfill enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "admin api listening");
    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    updater.shutdown();
    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler did not shut down cleanly");
        }
    }
    if let Some(handle) = startup {
        if let Err(err) = handle.await {
            error!(error = %err, "startup backfill task panicked");
        }
    }
    state.join_background().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("terminate received, shutting down"),
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    details: String,
}

impl ApiError {
    fn bad_request(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            details: details.into(),
        }
    }

    fn invalid_date(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_date",
            details: details.into(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        let (status, kind) = match &err {
            IngestError::ConcurrencyRejected => (StatusCode::CONFLICT, "concurrency_rejected"),
            IngestError::InvalidDate(_) => (StatusCode::BAD_REQUEST, "invalid_date"),
            IngestError::Scrape(ScrapeError::Transport { .. }) => {
                (StatusCode::BAD_GATEWAY, "fetch_failed")
            }
            IngestError::Scrape(ScrapeError::Parse(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "parse_failed")
            }
            IngestError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_failed"),
        };
        Self {
            status,
            kind,
            details: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(kind = self.kind, details = %self.details, "request failed");
        }
        (
            self.status,
            Json(json!({ "error": self.kind, "details": self.details })),
        )
            .into_response()
    }
}

fn parse_date_arg(name: &str, value: &str) -> Result<RaceDate, ApiError> {
    parse_race_date(value.trim())
        .map_err(|_| ApiError::invalid_date(format!("{name} must be YYYY-MM-DD, got {value:?}")))
}

#[derive(Debug, Deserialize)]
struct ScrapeDateRequest {
    date: String,
}

#[derive(Debug, Deserialize, Default)]
struct GapsQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Serialize)]
struct GapsResponse {
    from: RaceDate,
    to: RaceDate,
    missing: Vec<RaceDate>,
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn scrape_date_handler(
    State(state): State<AppState>,
    body: Result<Json<ScrapeDateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let date = parse_date_arg("date", &request.date)?;
    let commit = state.updater.scrape_date(date).await?;
    Ok(Json(commit).into_response())
}

async fn scrape_yesterday_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let commit = state.updater.scrape_yesterday().await?;
    Ok(Json(commit).into_response())
}

async fn backfill_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let handle = state.updater.start_backfill()?;
    state.track(handle);
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response())
}

async fn status_handler(State(state): State<AppState>) -> Response {
    Json(state.updater.status().await).into_response()
}

async fn gaps_handler(
    State(state): State<AppState>,
    Query(query): Query<GapsQuery>,
) -> Result<Response, ApiError> {
    let to = match query.to.as_deref() {
        Some(raw) => parse_date_arg("to", raw)?,
        None => state.updater.clock().yesterday(),
    };
    let from = match query.from.as_deref() {
        Some(raw) => parse_date_arg("from", raw)?,
        None => to
            .checked_sub_days(Days::new(DEFAULT_GAP_WINDOW_DAYS - 1))
            .unwrap_or(to),
    };
    let missing = state.updater.find_gaps(from, to).await?;
    info!(
        from = %from.format(DATE_FORMAT),
        to = %to.format(DATE_FORMAT),
        missing = missing.len(),
        "gap query"
    );
    Ok(Json(GapsResponse { from, to, missing }).into_response())
}
