//! Router-level tests: acknowledgement shapes, signature handling and identity.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bigdecimal::BigDecimal;
use earnify_backend::api::{self, AppState};
use earnify_backend::auth::{ROLE_HEADER, USER_ID_HEADER};
use earnify_backend::config::PaymentsConfig;
use earnify_backend::database::memory::InMemoryStore;
use earnify_backend::database::transaction_repository::TransactionStatus;
use earnify_backend::database::user_repository::UserStore;
use earnify_backend::database::Stores;
use earnify_backend::payments::factory::PaymentProviderFactory;
use earnify_backend::payments::providers::lipana::{LipanaCredentials, SIGNATURE_HEADER};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const LIPANA_SECRET: &str = "whsec_test_secret";

fn store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new().with_setting(
        "paymentMethodsEnabled",
        json!({"mpesa": true, "lipana": true, "bank": true}),
    ))
}

async fn app() -> Router {
    app_with(store()).await
}

async fn app_with(store: Arc<InMemoryStore>) -> Router {
    let factory = PaymentProviderFactory::new(PaymentsConfig {
        request_timeout_secs: 5,
        lipana: LipanaCredentials {
            api_key: Some("lip_sk_test".to_string()),
            webhook_secret: Some(LIPANA_SECRET.to_string()),
            base_url: None,
        },
        ..Default::default()
    })
    .unwrap();
    let state = AppState::build(Stores::in_memory(store), Arc::new(factory))
        .await
        .unwrap();
    api::router(state)
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(LIPANA_SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
}

#[tokio::test]
async fn lipana_signature_mismatch_is_unauthorized() {
    let body = serde_json::to_vec(&json!({
        "event": "payment.success",
        "data": {"transactionId": "TXN_1", "amount": 100}
    }))
    .unwrap();

    let request = post_json("/api/webhooks/lipana")
        .header(SIGNATURE_HEADER, "deadbeef")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, payload) = send(app().await, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["error"], "UNAUTHORIZED");
}

#[tokio::test]
async fn signed_lipana_webhook_is_acknowledged() {
    let body = serde_json::to_vec(&json!({
        "event": "payment.success",
        "data": {"transactionId": "TXN_unknown", "amount": 100}
    }))
    .unwrap();

    let request = post_json("/api/webhooks/lipana")
        .header(SIGNATURE_HEADER, sign(&body))
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, payload) = send(app().await, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({"received": true}));
}

#[tokio::test]
async fn stk_callback_is_always_accepted() {
    for body in [
        b"not json at all".to_vec(),
        serde_json::to_vec(&json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "1",
                "CheckoutRequestID": "ws_CO_nobody",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }}
        }))
        .unwrap(),
    ] {
        let request = post_json("/api/mpesa/callback")
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, payload) = send(app().await, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["ResultCode"], 0);
        assert_eq!(payload["ResultDesc"], "Accepted");
    }
}

#[tokio::test]
async fn c2b_validation_accepts_and_generic_callback_acks() {
    let body = serde_json::to_vec(&json!({"BillRefNumber": "EARN-123"})).unwrap();
    let request = post_json("/api/mpesa/c2b/validation")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, payload) = send(app().await, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["ResultCode"], 0);

    let body = serde_json::to_vec(&json!({"response": {"Status": "Failed"}})).unwrap();
    let request = post_json("/api/payments/callback")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, payload) = send(app().await, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({"success": true}));
}

#[tokio::test]
async fn user_routes_require_identity() {
    let request = Request::builder()
        .uri("/api/users/me")
        .body(Body::empty())
        .unwrap();
    let (status, payload) = send(app().await, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["error"], "UNAUTHORIZED");
}

#[tokio::test]
async fn registered_user_checks_in_once() {
    let app = app().await;
    let user_id = Uuid::new_v4().to_string();

    let request = post_json("/api/users")
        .header(USER_ID_HEADER, user_id.as_str())
        .body(Body::from("{}"))
        .unwrap();
    let (status, payload) = send(app.clone(), request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(payload["data"]["id"], user_id.as_str());

    let checkin = || {
        Request::builder()
            .method("POST")
            .uri("/api/checkin")
            .header(USER_ID_HEADER, user_id.as_str())
            .body(Body::empty())
            .unwrap()
    };
    let (status, payload) = send(app.clone(), checkin()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["success"], true);

    let (status, payload) = send(app.clone(), checkin()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(payload["error"], "DAILY_LIMIT_REACHED");
}

#[tokio::test]
async fn public_settings_hide_credentials_and_admin_needs_role() {
    let app = app().await;
    let request = Request::builder()
        .uri("/api/settings/public")
        .body(Body::empty())
        .unwrap();
    let (status, payload) = send(app.clone(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["data"]["currencySymbol"], "KSh");
    assert!(!payload.to_string().contains("lip_sk_test"));

    let request = Request::builder()
        .uri("/api/admin/dashboard")
        .header(USER_ID_HEADER, Uuid::new_v4().to_string())
        .header(ROLE_HEADER, "user")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bank_deposit_survives_gateway_callbacks() {
    let store = store();
    let app = app_with(store.clone()).await;
    let user_id = Uuid::new_v4();

    let request = post_json("/api/users")
        .header(USER_ID_HEADER, user_id.to_string())
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(app.clone(), request).await;
    assert_eq!(status, StatusCode::CREATED);

    let body = serde_json::to_vec(&json!({
        "userId": user_id,
        "amount": 1_000_000,
        "provider": "bank"
    }))
    .unwrap();
    let request = post_json("/api/deposits")
        .header(USER_ID_HEADER, user_id.to_string())
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send(app.clone(), request).await;
    assert_eq!(status, StatusCode::CREATED);

    let entries = store.all_transactions().await;
    assert_eq!(entries.len(), 1);
    let deposit_id = entries[0].id;

    let callback = serde_json::to_vec(&json!({
        "external_reference": deposit_id.to_string(),
        "status": "SUCCESS",
        "amount": 1_000_000,
        "mpesa_reference": "SGRFORGED1"
    }))
    .unwrap();
    let request = post_json("/api/payments/callback")
        .body(Body::from(callback))
        .unwrap();
    let (status, payload) = send(app.clone(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({"success": true}));

    let confirmation = serde_json::to_vec(&json!({
        "TransID": "RKTQFORGED",
        "TransAmount": "1000000.00",
        "BillRefNumber": format!("EARN-{}", deposit_id),
        "MSISDN": "254712345678"
    }))
    .unwrap();
    let request = post_json("/api/mpesa/c2b/confirmation")
        .body(Body::from(confirmation))
        .unwrap();
    let (status, payload) = send(app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["ResultCode"], 0);

    let entries = store.all_transactions().await;
    assert_eq!(entries[0].status, TransactionStatus::Pending);
    let user = store.find_user(user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(0));
}
