use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::board::{MoveLeadCommand, MoveLeadResponse};
use super::feed::ChangeFeed;
use super::models::StageStatus;
use super::service::{CrmService, LeadIntake};
use super::webhook::{SIGNATURE_HEADER, WebhookReconciler};
use crate::errors::{CrmError, WebhookError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: CrmService,
    pub reconciler: WebhookReconciler,
    pub feed: ChangeFeed,
    pub webhook_secret: Option<String>,
    pub signature_tolerance: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    pub email: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateStageRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct UpdateStageRequest {
    pub name: Option<String>,
    pub status: Option<StageStatus>,
}

#[derive(Deserialize)]
pub struct StageOrder {
    pub stage_id: String,
    pub order: i32,
}

#[derive(Deserialize)]
pub struct ReorderStagesRequest {
    pub orders: Vec<StageOrder>,
}

#[derive(Deserialize)]
pub struct MoveLeadRequest {
    pub stage_id: String,
    pub tenant_id: String,
}

#[derive(Deserialize)]
pub struct CreateTagRequest {
    pub name: String,
    pub color: Option<String>,
}

#[derive(Deserialize)]
pub struct AssignTagsRequest {
    pub tag_ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct AppointmentRequest {
    pub next_appointment_at: Option<DateTime<Utc>>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::NotFound(msg) | ApiError::BadRequest(msg) | ApiError::Internal(msg) => msg,
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CrmError> for ApiError {
    fn from(err: CrmError) -> Self {
        if err.is_not_found() {
            return ApiError::NotFound(err.to_string());
        }
        match err {
            CrmError::Validation(_) | CrmError::StageHasLeads { .. } | CrmError::NoIntakeStage { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::SignatureInvalid(_) | WebhookError::MalformedPayload(_) => {
                tracing::warn!(error = %err, "rejected payment webhook");
                ApiError::BadRequest(err.to_string())
            }
            WebhookError::MissingSecret | WebhookError::Recording(_) => {
                tracing::error!(error = %err, "payment webhook failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/tenants", post(create_tenant))
        .route("/api/tenants/{id}/board", get(get_board))
        .route(
            "/api/tenants/{id}/stages",
            get(list_stages).post(create_stage),
        )
        .route("/api/tenants/{id}/stages/order", put(reorder_stages))
        .route("/api/stages/{id}", patch(update_stage).delete(delete_stage))
        .route("/api/tenants/{id}/leads", post(create_lead))
        .route("/api/tenants/{id}/tags", post(create_tag))
        .route("/api/leads/{id}", get(get_lead))
        .route("/api/leads/{id}/move", post(move_lead))
        .route("/api/leads/{id}/tags", put(assign_tags))
        .route("/api/leads/{id}/appointment", put(set_appointment))
        .route("/api/webhooks/payments", post(payment_webhook))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_tenant(
    State(state): State<SharedState>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = state.service.create_tenant(&req.name, req.email).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

async fn get_board(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.load_board(&id).await?))
}

async fn list_stages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.list_stages(&id).await?))
}

async fn create_stage(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CreateStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stage = state.service.create_stage(&id, &req.name).await?;
    Ok((StatusCode::CREATED, Json(stage)))
}

async fn reorder_stages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ReorderStagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let orders = req
        .orders
        .into_iter()
        .map(|o| (o.stage_id, o.order))
        .collect();
    Ok(Json(state.service.reorder_stages(&id, orders).await?))
}

async fn update_stage(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.update_stage(&id, req.name, req.status).await?))
}

async fn delete_stage(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_stage(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_lead(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(intake): Json<LeadIntake>,
) -> Result<impl IntoResponse, ApiError> {
    let lead = state.service.create_lead(&id, intake).await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn get_lead(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_lead(&id).await?))
}

/// Stage-Move command. Always answers `{success, error?}`; the status code
/// follows the error class so plain HTTP clients can branch on it too.
async fn move_lead(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<MoveLeadRequest>,
) -> Response {
    let command = MoveLeadCommand {
        lead_id: id,
        stage_id: req.stage_id,
        tenant_id: req.tenant_id,
    };
    match state.service.move_lead(&command).await {
        Ok(_) => (StatusCode::OK, Json(MoveLeadResponse::ok())).into_response(),
        Err(e) => {
            let message = e.to_string();
            let status = ApiError::from(e).status();
            (status, Json(MoveLeadResponse::failed(message))).into_response()
        }
    }
}

async fn create_tag(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CreateTagRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tag = state.service.create_tag(&id, &req.name, req.color).await?;
    Ok((StatusCode::CREATED, Json(tag)))
}

async fn assign_tags(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AssignTagsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.assign_tags(&id, req.tag_ids).await?))
}

async fn set_appointment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AppointmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .service
            .set_next_appointment(&id, req.next_appointment_at)
            .await?,
    ))
}

/// Payment provider webhook. The body is taken raw because the signature
/// covers the exact bytes sent.
async fn payment_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let outcome = state
        .reconciler
        .handle(
            &body,
            signature,
            state.webhook_secret.as_deref(),
            state.signature_tolerance,
        )
        .await?;
    tracing::debug!(state = ?outcome.state(), "payment webhook handled");
    Ok(Json(outcome.acknowledgement()))
}
