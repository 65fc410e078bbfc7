//! Axum JSON API over the scouting engine.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shopscout_core::{CollectionRequest, Lens, ProviderQuota, RecommendationScore};
use shopscout_engine::{build_engine, Engine, EngineConfig, EngineError, FusionRequest};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shopscout-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/collect", post(collect_handler))
        .route("/fuse", post(fuse_handler))
        .route("/recommendations", get(recommendations_handler))
        .route("/quota", get(quota_handler))
        .route("/tasks/{id}", get(task_handler))
        .with_state(state)
}

pub async fn serve(config: &EngineConfig) -> anyhow::Result<()> {
    let engine = build_engine(config).await?;
    let listener = TcpListener::bind(config.bind.as_str()).await?;
    info!(addr = %listener.local_addr()?, "shopscout api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&EngineConfig::from_env()).await
}

/// JSON error body: `{success: false, error, hint?}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    hint: Option<String>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            hint: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            hint: None,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::NoDataExtracted { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            hint: err.hint().map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "success": false, "error": self.message });
        if let Some(hint) = self.hint {
            body["hint"] = json!(hint);
        }
        (self.status, Json(body)).into_response()
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn collect_handler(
    State(state): State<AppState>,
    payload: Result<Json<CollectionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let response = state.engine.collect(request).await?;
    Ok(Json(response).into_response())
}

async fn fuse_handler(
    State(state): State<AppState>,
    payload: Result<Json<FusionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let response = state.engine.fuse(request).await?;
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct RecommendationsQuery {
    lens: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RecommendationsBody {
    success: bool,
    lens: Lens,
    count: usize,
    recommendations: Vec<RecommendationScore>,
}

async fn recommendations_handler(
    State(state): State<AppState>,
    Query(query): Query<RecommendationsQuery>,
) -> Result<Json<RecommendationsBody>, ApiError> {
    let lens = match query.lens.as_deref() {
        None | Some("") => Lens::Blended,
        Some(text) => text.parse::<Lens>().map_err(ApiError::bad_request)?,
    };
    if query.limit == Some(0) {
        return Err(ApiError::bad_request("limit must be a positive integer"));
    }
    let recommendations = state.engine.recommend(lens, query.limit).await?;
    Ok(Json(RecommendationsBody {
        success: true,
        lens,
        count: recommendations.len(),
        recommendations,
    }))
}

#[derive(Debug, Serialize)]
struct QuotaBody {
    success: bool,
    quotas: Vec<ProviderQuota>,
}

async fn quota_handler(State(state): State<AppState>) -> Json<QuotaBody> {
    Json(QuotaBody {
        success: true,
        quotas: state.engine.quotas().await,
    })
}

async fn task_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match state.engine.task(id).await? {
        Some(task) => Ok(Json(json!({ "success": true, "task": task })).into_response()),
        None => Err(ApiError::not_found(format!("task {id} not found"))),
    }
}
