use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};

use crate::crypto::SIGNATURE_ALGORITHM;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::types::*;

pub fn create_router(state: Arc<AppState>) -> Router {
    let iou = Router::new()
        .route("/me", get(whoami))
        .route("/peers", get(peers))
        .route("/generatekeys", get(generate_keys).post(generate_keys))
        .route("/ious", get(list_ious))
        .route("/create-iou", post(create_iou))
        .route("/my-ious", get(my_ious));

    Router::new()
        .route("/health", get(health))
        .nest("/api/iou", iou)
        .with_state(state)
}

// ============ Health Endpoints ============

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(state.health().await))
}

// ============ Identity Endpoints ============

async fn whoami(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let me = state.service.who_am_i().await?;
    Ok(Json(ApiResponse::success(WhoAmIResponse { me })))
}

/// Parties that can be named as counterparties
async fn peers(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let peers = state.service.list_peers().await?;
    Ok(Json(ApiResponse::success(PeersResponse { peers })))
}

// ============ Key Endpoints ============

async fn generate_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GenerateKeysQuery>,
) -> ApiResult<impl IntoResponse> {
    let generated = state.service.generate_keys(query.size).await?;
    Ok(Json(ApiResponse::success(GenerateKeysResponse {
        message: "Keys Generated".into(),
        algorithm: SIGNATURE_ALGORITHM,
        key_size: generated.key_size,
        fingerprint: generated.fingerprint,
        public_key_path: state.config.public_key_path().display().to_string(),
    })))
}

// ============ IOU Endpoints ============

async fn list_ious(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let records = state.service.list_all().await?;
    Ok(Json(ApiResponse::success(state.service.inspect(records))))
}

async fn my_ious(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let me = state.service.who_am_i().await?;
    let records = state.service.list_mine(&me).await?;
    Ok(Json(ApiResponse::success(state.service.inspect(records))))
}

async fn create_iou(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CreateIouForm>,
) -> ApiResult<impl IntoResponse> {
    let party_name = form.party_name.ok_or_else(|| {
        ApiError::InvalidArgument("Parameter 'partyName' must not be null".into())
    })?;
    let value = form
        .iou_value
        .as_deref()
        .map(str::trim)
        .ok_or_else(|| ApiError::InvalidArgument("Parameter 'iouValue' must not be null".into()))?
        .parse::<i64>()
        .map_err(|_| ApiError::InvalidArgument("Parameter 'iouValue' must be an integer".into()))?;

    let created = state.service.create(value, &party_name).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreateIouResponse::from(&created))),
    ))
}
