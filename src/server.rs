use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::analysis::{normalize_url, AnalysisOptions, AnalysisReport, Analyzer, UrlError};
use crate::audit::AuditMode;
use crate::config::Config;
use crate::history::{HistoryRecord, HistoryStore};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Clone)]
struct ApiState {
    analyzer: Arc<Analyzer>,
    config: Config,
    db_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    ok: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    ok: bool,
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }

    fn from_analysis(error: anyhow::Error) -> Self {
        if let Some(url_error) = error.downcast_ref::<UrlError>() {
            return Self::bad_request(url_error.to_string());
        }
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: format!("{error:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiErrorBody {
            ok: false,
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Clone, Deserialize)]
struct AnalyzeRequest {
    baseline: String,
    target: String,
    #[serde(default)]
    urlscan: bool,
    #[serde(default)]
    browser: bool,
    ignore_keys: Option<Vec<String>>,
    full_log: Option<bool>,
    #[serde(default = "default_true")]
    persist_history: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    target: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    total: u64,
    records: Vec<HistoryRecord>,
}

pub async fn run_server(config: Config, bind: SocketAddr) -> Result<()> {
    let state = ApiState {
        analyzer: Arc::new(Analyzer::from_config(&config)?),
        db_path: config.resolved_history_db_path(),
        config,
    };

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("WARM API listening on http://{bind}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/history", get(history))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<ApiResponse<HealthResponse>> {
    ok(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn analyze(
    State(state): State<ApiState>,
    Json(request): Json<AnalyzeRequest>,
) -> ApiResult<AnalysisReport> {
    let options = request_options(&state.config, &request);
    let report = state
        .analyzer
        .run(&request.baseline, &request.target, &options)
        .await
        .map_err(ApiError::from_analysis)?;

    if request.persist_history {
        let record = HistoryRecord::from_report(&report);
        if let Err(err) = open_store(&state).and_then(|store| {
            store.insert(&record).map_err(ApiError::internal)
        }) {
            warn!("failed to record analysis history: {}", err.message);
        }
    }

    Ok(ok(report))
}

async fn history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<HistoryResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }
    let target = query
        .target
        .as_deref()
        .map(normalize_url)
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let store = open_store(&state)?;
    let records = match target.as_deref() {
        Some(target) => store.for_target(target, limit),
        None => store.recent(limit),
    }
    .map_err(ApiError::internal)?;
    let total = store.count().map_err(ApiError::internal)?;
    Ok(ok(HistoryResponse { total, records }))
}

fn request_options(config: &Config, request: &AnalyzeRequest) -> AnalysisOptions {
    let mut options = AnalysisOptions::from_config(config);
    options.browser = request.browser;
    options.scan = request.urlscan;
    if let Some(keys) = &request.ignore_keys {
        options.ignore_keys = keys
            .iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
    }
    if let Some(full_log) = request.full_log {
        options.audit_mode = if full_log {
            AuditMode::Full
        } else {
            AuditMode::MismatchesOnly
        };
    }
    options
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse { ok: true, data })
}

fn default_true() -> bool {
    true
}

fn open_store(state: &ApiState) -> std::result::Result<HistoryStore, ApiError> {
    HistoryStore::open(&state.db_path).map_err(ApiError::internal)
}
