use crate::api::{with_request_id, AppState};
use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::middleware::error::success_response;
use crate::services::payment_service::{DepositRequest, WithdrawalRequest};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default, alias = "user_id")]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// POST /api/deposits
pub async fn initiate_deposit(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Json(request): Json<DepositRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let snapshot = state.settings.snapshot().await;
    let response = with_request_id(
        state
            .payments
            .initiate_deposit(&ctx, &snapshot, request)
            .await,
        &headers,
    )?;
    Ok((StatusCode::CREATED, success_response(response)))
}

/// POST /api/withdrawals
pub async fn request_withdrawal(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Json(request): Json<WithdrawalRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let snapshot = state.settings.snapshot().await;
    let transaction = with_request_id(
        state
            .payments
            .request_withdrawal(&ctx, &snapshot, request)
            .await,
        &headers,
    )?;
    Ok((StatusCode::CREATED, success_response(transaction)))
}

/// GET /api/transactions
pub async fn list_transactions(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let transactions = with_request_id(
        state
            .payments
            .list_transactions(&ctx, query.user_id, query.limit)
            .await,
        &headers,
    )?;
    Ok(success_response(transactions))
}
