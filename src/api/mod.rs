//! HTTP surface. Handlers stay thin: extract the caller, read the current
//! settings snapshot and hand off to a service.

pub mod admin;
pub mod payments;
pub mod rewards;
pub mod settings;
pub mod tasks;
pub mod users;
pub mod webhooks;

use crate::database::Stores;
use crate::error::AppResult;
use crate::health::{HealthChecker, HealthStatus};
use crate::middleware::error::get_request_id_from_headers;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::payments::factory::PaymentProviderFactory;
use crate::services::settings::SettingsError;
use crate::services::{
    AdminService, PaymentService, RewardService, SettingsService, TaskService, UserService,
    WebhookProcessor,
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsService>,
    pub payments: Arc<PaymentService>,
    pub webhooks: Arc<WebhookProcessor>,
    pub admin: Arc<AdminService>,
    pub tasks: Arc<TaskService>,
    pub rewards: Arc<RewardService>,
    pub users: Arc<UserService>,
    pub health: HealthChecker,
}

impl AppState {
    /// Loads the first settings snapshot and wires every service to `stores`
    pub async fn build(
        stores: Stores,
        factory: Arc<PaymentProviderFactory>,
    ) -> Result<Self, SettingsError> {
        let settings = Arc::new(SettingsService::load(stores.settings.clone()).await?);

        Ok(Self {
            payments: Arc::new(PaymentService::new(
                stores.ledger.clone(),
                stores.users.clone(),
                factory.clone(),
            )),
            webhooks: Arc::new(WebhookProcessor::new(stores.ledger.clone(), factory.clone())),
            admin: Arc::new(AdminService::new(
                stores.ledger.clone(),
                stores.users.clone(),
                stores.tasks.clone(),
                stores.packages.clone(),
                settings.clone(),
            )),
            tasks: Arc::new(TaskService::new(stores.users.clone(), stores.tasks.clone())),
            rewards: Arc::new(RewardService::new(
                stores.users.clone(),
                stores.packages.clone(),
            )),
            users: Arc::new(UserService::new(stores.users.clone())),
            health: HealthChecker::new(stores.pool.clone(), factory),
            settings,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/settings/public", get(settings::public_settings))
        .route("/api/users", post(users::register))
        .route("/api/users/me", get(users::me))
        .route("/api/deposits", post(payments::initiate_deposit))
        .route("/api/withdrawals", post(payments::request_withdrawal))
        .route("/api/transactions", get(payments::list_transactions))
        .route("/api/tasks", get(tasks::list_tasks))
        .route("/api/tasks/music/{id}/complete", post(tasks::complete_music))
        .route("/api/tasks/trivia/{id}/answer", post(tasks::answer_trivia))
        .route("/api/packages", get(rewards::list_packages))
        .route("/api/packages/{id}/purchase", post(rewards::purchase_package))
        .route("/api/checkin", post(rewards::checkin))
        .route("/api/payments/callback", post(webhooks::payments_callback))
        .route("/api/mpesa/callback", post(webhooks::mpesa_callback))
        .route("/api/mpesa/c2b/validation", post(webhooks::c2b_validation))
        .route("/api/mpesa/c2b/confirmation", post(webhooks::c2b_confirmation))
        .route("/api/webhooks/lipana", post(webhooks::lipana_webhook))
        .merge(admin_routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/api/admin/transactions/pending", get(admin::list_pending))
        .route("/api/admin/deposits/{id}/approve", post(admin::approve_deposit))
        .route("/api/admin/deposits/{id}/reject", post(admin::reject_deposit))
        .route(
            "/api/admin/withdrawals/{id}/approve",
            post(admin::approve_withdrawal),
        )
        .route(
            "/api/admin/withdrawals/{id}/reject",
            post(admin::reject_withdrawal),
        )
        .route("/api/admin/users/{id}/ban", post(admin::set_banned))
        .route("/api/admin/settings/reload", post(admin::reload_settings))
        .route("/api/admin/settings/{key}", put(admin::update_setting))
        .route("/api/admin/tasks/music", post(admin::create_music_task))
        .route("/api/admin/tasks/trivia", post(admin::create_trivia_question))
        .route("/api/admin/tasks/{kind}/{id}/active", post(admin::set_task_active))
        .route("/api/admin/packages", post(admin::create_package))
        .route("/api/admin/dashboard", get(admin::dashboard))
}

/// Attaches the request id set by [`SetRequestIdLayer`] to a failed result
pub(crate) fn with_request_id<T>(result: AppResult<T>, headers: &HeaderMap) -> AppResult<T> {
    result.map_err(|e| e.maybe_request_id(get_request_id_from_headers(headers)))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let snapshot = state.settings.snapshot().await;
    let status = state.health.check_health(&snapshot).await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}
