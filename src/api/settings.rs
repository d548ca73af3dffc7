use crate::api::AppState;
use crate::middleware::error::success_response;
use axum::{extract::State, Json};

/// GET /api/settings/public
///
/// Never includes gateway credentials.
pub async fn public_settings(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.settings.snapshot().await;
    success_response(snapshot.public_view())
}
