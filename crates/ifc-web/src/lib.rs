//! JSON query surface for the dashboard and digest collaborators, plus an on-demand run trigger.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ifc_core::SourceKind;
use ifc_storage::{ItemQuery, ItemStore, SqliteItemStore};
use ifc_sync::{parse_time_bound, CollectError, Collector, CollectorConfig, RunWindow};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "ifc-web";

const MAX_ITEMS_PER_PAGE: u32 = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ItemStore>,
    pub collector: Option<Arc<Collector>>,
}

impl AppState {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            collector: None,
        }
    }

    pub fn with_collector(mut self, collector: Arc<Collector>) -> Self {
        self.collector = Some(collector);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct ItemsParams {
    since: Option<String>,
    until: Option<String>,
    source: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RunParams {
    since: Option<String>,
    until: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/items", get(items_handler))
        .route("/watermarks", get(watermarks_handler))
        .route("/runs", post(run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &CollectorConfig, port: u16) -> anyhow::Result<()> {
    let store: Arc<dyn ItemStore> = Arc::new(SqliteItemStore::open(&config.storage.database_url).await?);
    let collector = Arc::new(Collector::from_config(config, store.clone()));
    let state = AppState::new(store).with_collector(collector);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving collected items");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn items_handler(State(state): State<Arc<AppState>>, Query(params): Query<ItemsParams>) -> Response {
    let now = Utc::now();
    let mut query = ItemQuery::default();

    if let Some(since) = params.since.as_deref() {
        match parse_time_bound(since, now) {
            Ok(start) => query.start = Some(start),
            Err(err) => return bad_request(err.to_string()),
        }
    }
    if let Some(until) = params.until.as_deref() {
        match parse_time_bound(until, now) {
            Ok(end) => query.end = Some(end),
            Err(err) => return bad_request(err.to_string()),
        }
    }
    if let Some(source) = params.source.as_deref() {
        match source.parse::<SourceKind>() {
            Ok(kind) => query = query.with_source(kind),
            Err(err) => return bad_request(err.to_string()),
        }
    }
    query.limit = Some(params.limit.unwrap_or(MAX_ITEMS_PER_PAGE).min(MAX_ITEMS_PER_PAGE));

    match state.store.query(&query).await {
        Ok(items) => Json(serde_json::json!({
            "count": items.len(),
            "items": items,
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn watermarks_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.watermarks().await {
        Ok(watermarks) => Json(serde_json::json!({ "watermarks": watermarks })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn run_handler(State(state): State<Arc<AppState>>, Query(params): Query<RunParams>) -> Response {
    let Some(collector) = state.collector.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "collection is not configured".to_string());
    };
    let window = match RunWindow::resolve(params.since.as_deref(), params.until.as_deref(), Utc::now()) {
        Ok(window) => window,
        Err(err) => return bad_request(err.to_string()),
    };

    match collector.collect(window).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err @ CollectError::Session(_)) => error_response(StatusCode::UNAUTHORIZED, err.to_string()),
        Err(err @ CollectError::SessionExpired { .. }) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": err.to_string(),
                "summary": err.summary(),
            })),
        )
            .into_response(),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn bad_request(message: String) -> Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

fn server_error(err: anyhow::Error) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}
