use crate::api::{with_request_id, AppState};
use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::middleware::error::success_response;
use crate::services::tasks::TriviaAnswer;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use uuid::Uuid;

/// GET /api/tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    let listing = with_request_id(state.tasks.list_tasks(&ctx).await, &headers)?;
    Ok(success_response(listing))
}

/// POST /api/tasks/music/{id}/complete
pub async fn complete_music(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let result = with_request_id(state.tasks.complete_music(&ctx, task_id).await, &headers)?;
    Ok(success_response(result))
}

/// POST /api/tasks/trivia/{id}/answer
pub async fn answer_trivia(
    State(state): State<AppState>,
    ctx: AuthContext,
    headers: HeaderMap,
    Path(question_id): Path<Uuid>,
    Json(body): Json<TriviaAnswer>,
) -> AppResult<Json<serde_json::Value>> {
    let result = with_request_id(
        state
            .tasks
            .answer_trivia(&ctx, question_id, &body.answer)
            .await,
        &headers,
    )?;
    Ok(success_response(result))
}
