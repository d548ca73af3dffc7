//! Back-office routes. The admin role is checked by each service call.

use crate::api::{with_request_id, AppState};
use crate::auth::AuthContext;
use crate::database::package_repository::NewPackage;
use crate::database::task_repository::{NewMusicTask, NewTriviaQuestion, TaskKind};
use crate::database::transaction_repository::TransactionType;
use crate::error::AppResult;
use crate::middleware::error::success_response;
use crate::services::admin::{ApprovalRequest, RejectionRequest};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

type JsonResponse = AppResult<Json<JsonValue>>;

#[derive(Debug, Default, Deserialize)]
pub struct PendingQuery {
    #[serde(default, rename = "type")]
    pub transaction_type: Option<TransactionType>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub banned: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

/// GET /api/admin/transactions/pending
pub async fn list_pending(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Query(query): Query<PendingQuery>,
) -> JsonResponse {
    let pending = with_request_id(
        state
            .admin
            .list_pending(&ctx, query.transaction_type, query.limit)
            .await,
        &headers,
    )?;
    Ok(success_response(pending))
}

/// POST /api/admin/deposits/{id}/approve
pub async fn approve_deposit(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<ApprovalRequest>,
) -> JsonResponse {
    let result = with_request_id(
        state.admin.approve_deposit(&ctx, id, request).await,
        &headers,
    )?;
    Ok(success_response(result))
}

/// POST /api/admin/deposits/{id}/reject
pub async fn reject_deposit(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<RejectionRequest>>,
) -> JsonResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let result = with_request_id(
        state.admin.reject_deposit(&ctx, id, request).await,
        &headers,
    )?;
    Ok(success_response(result))
}

/// POST /api/admin/withdrawals/{id}/approve
pub async fn approve_withdrawal(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<ApprovalRequest>,
) -> JsonResponse {
    let result = with_request_id(
        state.admin.approve_withdrawal(&ctx, id, request).await,
        &headers,
    )?;
    Ok(success_response(result))
}

/// POST /api/admin/withdrawals/{id}/reject
pub async fn reject_withdrawal(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<RejectionRequest>>,
) -> JsonResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let result = with_request_id(
        state.admin.reject_withdrawal(&ctx, id, request).await,
        &headers,
    )?;
    Ok(success_response(result))
}

/// POST /api/admin/users/{id}/ban
pub async fn set_banned(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(request): Json<BanRequest>,
) -> JsonResponse {
    let user = with_request_id(
        state.admin.set_banned(&ctx, user_id, request.banned).await,
        &headers,
    )?;
    Ok(success_response(user))
}

/// PUT /api/admin/settings/{key}
pub async fn update_setting(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(value): Json<JsonValue>,
) -> JsonResponse {
    let entry = with_request_id(
        state.admin.update_setting(&ctx, &key, value).await,
        &headers,
    )?;
    Ok(success_response(entry))
}

/// POST /api/admin/settings/reload
pub async fn reload_settings(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
) -> JsonResponse {
    let loaded_at = with_request_id(state.admin.reload_settings(&ctx).await, &headers)?;
    Ok(success_response(json!({ "loadedAt": loaded_at })))
}

/// POST /api/admin/tasks/music
pub async fn create_music_task(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Json(new): Json<NewMusicTask>,
) -> AppResult<(StatusCode, Json<JsonValue>)> {
    let task = with_request_id(state.admin.create_music_task(&ctx, new).await, &headers)?;
    Ok((StatusCode::CREATED, success_response(task)))
}

/// POST /api/admin/tasks/trivia
pub async fn create_trivia_question(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Json(new): Json<NewTriviaQuestion>,
) -> AppResult<(StatusCode, Json<JsonValue>)> {
    let question = with_request_id(
        state.admin.create_trivia_question(&ctx, new).await,
        &headers,
    )?;
    Ok((StatusCode::CREATED, success_response(question)))
}

/// POST /api/admin/tasks/{kind}/{id}/active
pub async fn set_task_active(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path((kind, id)): Path<(TaskKind, Uuid)>,
    Json(request): Json<ActiveRequest>,
) -> JsonResponse {
    with_request_id(
        state
            .admin
            .set_content_active(&ctx, kind, id, request.active)
            .await,
        &headers,
    )?;
    Ok(success_response(json!({
        "kind": kind,
        "id": id,
        "active": request.active,
    })))
}

/// POST /api/admin/packages
pub async fn create_package(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Json(new): Json<NewPackage>,
) -> AppResult<(StatusCode, Json<JsonValue>)> {
    let package = with_request_id(state.admin.create_package(&ctx, new).await, &headers)?;
    Ok((StatusCode::CREATED, success_response(package)))
}

/// GET /api/admin/dashboard
pub async fn dashboard(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
) -> JsonResponse {
    let dashboard = with_request_id(state.admin.dashboard(&ctx).await, &headers)?;
    Ok(success_response(dashboard))
}
