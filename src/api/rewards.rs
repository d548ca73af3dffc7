use crate::api::{with_request_id, AppState};
use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::middleware::error::success_response;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use uuid::Uuid;

/// GET /api/packages
pub async fn list_packages(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    let packages = with_request_id(state.rewards.list_packages().await, &headers)?;
    Ok(success_response(packages))
}

/// POST /api/packages/{id}/purchase
pub async fn purchase_package(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(package_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let snapshot = state.settings.snapshot().await;
    let result = with_request_id(
        state
            .rewards
            .purchase_package(&ctx, &snapshot, package_id)
            .await,
        &headers,
    )?;
    Ok(success_response(result))
}

/// POST /api/checkin
pub async fn checkin(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    let snapshot = state.settings.snapshot().await;
    let result = with_request_id(state.rewards.checkin(&ctx, &snapshot).await, &headers)?;
    Ok(success_response(result))
}
