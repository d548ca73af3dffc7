use crate::api::{with_request_id, AppState};
use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::middleware::error::success_response;
use crate::services::users::RegisterRequest;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};

/// POST /api/users
pub async fn register(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let user = with_request_id(state.users.register(&ctx, request).await, &headers)?;
    Ok((StatusCode::CREATED, success_response(user)))
}

/// GET /api/users/me
pub async fn me(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    let user = with_request_id(state.users.profile(&ctx).await, &headers)?;
    Ok(success_response(user))
}
