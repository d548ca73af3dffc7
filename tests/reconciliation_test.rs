//! End-to-end ledger flows against the in-memory store and a mocked Daraja API.

use bigdecimal::BigDecimal;
use earnify_backend::auth::AuthContext;
use earnify_backend::config::PaymentsConfig;
use earnify_backend::database::memory::InMemoryStore;
use earnify_backend::database::transaction_repository::{
    LedgerStore, TransactionStatus, TransactionType,
};
use earnify_backend::database::user_repository::{NewUser, User, UserStore};
use earnify_backend::error::ErrorCode;
use earnify_backend::payments::factory::PaymentProviderFactory;
use earnify_backend::payments::providers::lipana::LipanaCredentials;
use earnify_backend::payments::providers::mpesa::MpesaCredentials;
use earnify_backend::payments::providers::payhero::PayHeroCredentials;
use earnify_backend::payments::types::ProviderName;
use earnify_backend::services::admin::ApprovalRequest;
use earnify_backend::services::payment_service::{DepositRequest, WithdrawalRequest};
use earnify_backend::services::{
    AdminService, PaymentService, ReconcileOutcome, SettingsService, SettingsSnapshot,
    WebhookProcessor,
};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    store: Arc<InMemoryStore>,
    payments: PaymentService,
    webhooks: WebhookProcessor,
    admin: AdminService,
    user_id: Uuid,
}

fn member(balance: i64) -> User {
    let mut user = NewUser {
        id: Uuid::new_v4(),
        display_name: Some("Achieng".to_string()),
        phone_number: Some("254712345678".to_string()),
        referral_code: "FLOW0001".to_string(),
        referred_by: None,
    }
    .into_user();
    user.wallet_balance = BigDecimal::from(balance);
    user
}

async fn harness(balance: i64, daraja: Option<&MockServer>) -> Harness {
    let mpesa = match daraja {
        Some(server) => MpesaCredentials {
            consumer_key: Some("test-key".to_string()),
            consumer_secret: Some("test-secret".to_string()),
            shortcode: Some("174379".to_string()),
            passkey: Some("test-passkey".to_string()),
            base_url: Some(server.uri()),
            ..Default::default()
        },
        None => MpesaCredentials::default(),
    };
    harness_with(
        balance,
        PaymentsConfig {
            mpesa,
            ..gateway_config()
        },
    )
    .await
}

fn gateway_config() -> PaymentsConfig {
    PaymentsConfig {
        request_timeout_secs: 5,
        callback_base_url: Some("https://api.earnify.test".to_string()),
        ..Default::default()
    }
}

async fn harness_with(balance: i64, config: PaymentsConfig) -> Harness {
    let user = member(balance);
    let user_id = user.id;
    let store = Arc::new(InMemoryStore::new().with_user(user));
    let factory = Arc::new(PaymentProviderFactory::new(config).unwrap());

    let settings = Arc::new(SettingsService::load(store.clone()).await.unwrap());
    Harness {
        payments: PaymentService::new(store.clone(), store.clone(), factory.clone()),
        webhooks: WebhookProcessor::new(store.clone(), factory),
        admin: AdminService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            settings,
        ),
        store,
        user_id,
    }
}

/// Default settings with every gateway switched on
fn all_methods_enabled() -> SettingsSnapshot {
    let mut snapshot = SettingsSnapshot::default();
    snapshot.payment_methods_enabled.payhero = true;
    snapshot.payment_methods_enabled.lipana = true;
    snapshot
}

async fn mount_oauth(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/oauth/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "mock-token",
            "expires_in": "3599"
        })))
        .mount(server)
        .await;
}

fn deposit(user_id: Uuid, amount: i64) -> DepositRequest {
    deposit_via(user_id, amount, "mpesa")
}

fn deposit_via(user_id: Uuid, amount: i64, provider: &str) -> DepositRequest {
    DepositRequest {
        user_id,
        amount: BigDecimal::from(amount),
        phone_number: Some("0712345678".to_string()),
        provider: provider.to_string(),
    }
}

async fn mount_stk_push(server: &MockServer, checkout_request_id: &str) {
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": checkout_request_id,
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing"
        })))
        .mount(server)
        .await;
}

fn c2b_confirmation(trans_id: &str, amount: &str, bill_ref: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "TransactionType": "Pay Bill",
        "TransID": trans_id,
        "TransTime": "20260115103000",
        "TransAmount": amount,
        "BusinessShortCode": "600638",
        "BillRefNumber": bill_ref,
        "MSISDN": "254712345678",
        "FirstName": "Achieng"
    }))
    .unwrap()
}

fn payhero_success(transaction_id: Uuid, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "forward_url": "",
        "status": true,
        "response": {
            "Amount": amount,
            "CheckoutRequestID": "ws_CO_ph_0001",
            "ExternalReference": transaction_id.to_string(),
            "MerchantRequestID": "3202-70921557-1",
            "MpesaReceiptNumber": "SGR7PH0001",
            "Phone": "+254712345678",
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "Status": "Success"
        }
    }))
    .unwrap()
}

fn lipana_signature(body: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn stk_success(checkout_request_id: &str, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "Body": {"stkCallback": {
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": checkout_request_id,
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "CallbackMetadata": {"Item": [
                {"Name": "Amount", "Value": amount},
                {"Name": "MpesaReceiptNumber", "Value": "QKL4XYZ123"},
                {"Name": "PhoneNumber", "Value": 254712345678u64}
            ]}
        }}
    }))
    .unwrap()
}

#[tokio::test]
async fn stk_push_then_callback_credits_wallet_once() {
    let daraja = MockServer::start().await;
    mount_oauth(&daraja).await;
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing"
        })))
        .expect(1)
        .mount(&daraja)
        .await;

    let h = harness(0, Some(&daraja)).await;
    let snapshot = SettingsSnapshot::default();
    let ctx = AuthContext::user(h.user_id);

    let response = h
        .payments
        .initiate_deposit(&ctx, &snapshot, deposit(h.user_id, 500))
        .await
        .unwrap();
    assert_eq!(response.transaction.status, TransactionStatus::Pending);
    assert_eq!(
        response.checkout_request_id.as_deref(),
        Some("ws_CO_191220191020363925")
    );

    let body = stk_success("ws_CO_191220191020363925", 500);
    let first = h
        .webhooks
        .process(ProviderName::Mpesa, &snapshot, &body, None)
        .await
        .unwrap();
    assert!(matches!(first, ReconcileOutcome::Credited { .. }));

    let replay = h
        .webhooks
        .process(ProviderName::Mpesa, &snapshot, &body, None)
        .await
        .unwrap();
    assert_eq!(replay, ReconcileOutcome::Duplicate);

    let user = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(500));
    let stored = h
        .store
        .find_transaction(response.transaction.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn rejected_stk_push_marks_the_deposit_rejected() {
    let daraja = MockServer::start().await;
    mount_oauth(&daraja).await;
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ResponseCode": "1",
            "ResponseDescription": "Unable to lock subscriber, a transaction is already in process"
        })))
        .mount(&daraja)
        .await;

    let h = harness(0, Some(&daraja)).await;
    let err = h
        .payments
        .initiate_deposit(
            &AuthContext::user(h.user_id),
            &SettingsSnapshot::default(),
            deposit(h.user_id, 200),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::GatewayRejected);
    assert!(err.user_message().contains("Unable to lock subscriber"));

    let entries = h.store.all_transactions().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, TransactionStatus::Rejected);
    let user = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(0));
}

#[tokio::test]
async fn unmatched_callback_is_acknowledged_without_side_effects() {
    let h = harness(250, None).await;
    let outcome = h
        .webhooks
        .process(
            ProviderName::Mpesa,
            &SettingsSnapshot::default(),
            &stk_success("ws_CO_unknown", 900),
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Unmatched);
    let user = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(250));
    assert!(h.store.all_transactions().await.is_empty());
}

#[tokio::test]
async fn approved_bank_withdrawal_leaves_the_remainder() {
    let h = harness(1000, None).await;
    let snapshot = SettingsSnapshot::default();

    let pending = h
        .payments
        .request_withdrawal(
            &AuthContext::user(h.user_id),
            &snapshot,
            WithdrawalRequest {
                user_id: h.user_id,
                amount: BigDecimal::from(500),
                method: "bank".to_string(),
                phone_number: None,
                account_details: Some(json!({"bank": "KCB", "accountNumber": "1100223344"})),
            },
        )
        .await
        .unwrap();
    assert_eq!(pending.transaction_type, TransactionType::Withdraw);

    let untouched = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(untouched.wallet_balance, BigDecimal::from(1000));

    let review = h
        .admin
        .approve_withdrawal(
            &AuthContext::admin(Uuid::new_v4()),
            pending.id,
            ApprovalRequest {
                user_id: h.user_id,
                amount: BigDecimal::from(500),
            },
        )
        .await
        .unwrap();

    assert_eq!(review.transaction.status, TransactionStatus::Completed);
    let user = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(500));
}

#[tokio::test]
async fn payhero_push_then_callback_credits_wallet_once() {
    let payhero = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/payments"))
        .and(header("Authorization", "Basic cGF5aGVybzp0ZXN0"))
        .and(body_partial_json(json!({
            "amount": 400,
            "phone_number": "254712345678",
            "channel_id": 911,
            "callback_url": "https://api.earnify.test/api/payments/callback"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "success": true,
            "status": "QUEUED",
            "reference": "E8UWT7CLUW",
            "CheckoutRequestID": "ws_CO_ph_0001"
        })))
        .expect(1)
        .mount(&payhero)
        .await;

    let h = harness_with(
        0,
        PaymentsConfig {
            payhero: PayHeroCredentials {
                api_key: Some("Basic cGF5aGVybzp0ZXN0".to_string()),
                channel_id: Some("911".to_string()),
                base_url: Some(payhero.uri()),
                callback_url: None,
            },
            ..gateway_config()
        },
    )
    .await;
    let snapshot = all_methods_enabled();

    let response = h
        .payments
        .initiate_deposit(
            &AuthContext::user(h.user_id),
            &snapshot,
            deposit_via(h.user_id, 400, "payhero"),
        )
        .await
        .unwrap();
    assert_eq!(response.transaction.status, TransactionStatus::Pending);
    assert_eq!(response.transaction.payment_method.as_deref(), Some("payhero"));
    assert_eq!(
        response.transaction.payment_reference.as_deref(),
        Some("E8UWT7CLUW")
    );

    let body = payhero_success(response.transaction.id, 400);
    let first = h
        .webhooks
        .process(ProviderName::PayHero, &snapshot, &body, None)
        .await
        .unwrap();
    assert!(matches!(
        first,
        ReconcileOutcome::Credited { transaction_id, .. } if transaction_id == response.transaction.id
    ));

    let replay = h
        .webhooks
        .process(ProviderName::PayHero, &snapshot, &body, None)
        .await
        .unwrap();
    assert_eq!(replay, ReconcileOutcome::Duplicate);

    let user = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(400));
}

#[tokio::test]
async fn lipana_push_then_signed_webhook_credits_by_payment_reference() {
    const SECRET: &str = "whsec_flow_secret";
    let lipana = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/transactions/push-stk"))
        .and(header("x-api-key", "lip_sk_flow"))
        .and(body_partial_json(json!({"phone": "+254712345678", "amount": 300})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "message": "STK push sent",
            "data": {"transactionId": "TXN_LIP_0001", "checkoutRequestId": "ws_CO_lip_0001"}
        })))
        .expect(1)
        .mount(&lipana)
        .await;

    let h = harness_with(
        0,
        PaymentsConfig {
            lipana: LipanaCredentials {
                api_key: Some("lip_sk_flow".to_string()),
                webhook_secret: Some(SECRET.to_string()),
                base_url: Some(lipana.uri()),
            },
            ..gateway_config()
        },
    )
    .await;
    let snapshot = all_methods_enabled();

    let response = h
        .payments
        .initiate_deposit(
            &AuthContext::user(h.user_id),
            &snapshot,
            deposit_via(h.user_id, 300, "lipana"),
        )
        .await
        .unwrap();
    assert_eq!(
        response.transaction.payment_reference.as_deref(),
        Some("TXN_LIP_0001")
    );

    let body = serde_json::to_vec(&json!({
        "event": "payment.success",
        "data": {"transactionId": "TXN_LIP_0001", "amount": 300, "phone": "+254712345678"}
    }))
    .unwrap();

    let forged = h
        .webhooks
        .process(ProviderName::Lipana, &snapshot, &body, Some("00ff"))
        .await
        .unwrap_err();
    assert!(forged.is_signature_failure());

    let signature = lipana_signature(&body, SECRET);
    let outcome = h
        .webhooks
        .process(ProviderName::Lipana, &snapshot, &body, Some(&signature))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Credited { .. }));

    let stored = h
        .store
        .find_transaction(response.transaction.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    let user = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(300));
}

#[tokio::test]
async fn lipana_reply_without_transaction_id_leaves_deposit_pending() {
    let lipana = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/transactions/push-stk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "message": "STK push sent",
            "data": {}
        })))
        .mount(&lipana)
        .await;

    let h = harness_with(
        0,
        PaymentsConfig {
            lipana: LipanaCredentials {
                api_key: Some("lip_sk_flow".to_string()),
                webhook_secret: None,
                base_url: Some(lipana.uri()),
            },
            ..gateway_config()
        },
    )
    .await;

    let err = h
        .payments
        .initiate_deposit(
            &AuthContext::user(h.user_id),
            &all_methods_enabled(),
            deposit_via(h.user_id, 300, "lipana"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::PaymentProviderError);

    let entries = h.store.all_transactions().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, TransactionStatus::Pending);
    assert_eq!(entries[0].payment_details["gateway_outcome"], "unknown");
}

#[tokio::test]
async fn c2b_confirmation_credits_by_bill_reference() {
    let daraja = MockServer::start().await;
    mount_oauth(&daraja).await;
    mount_stk_push(&daraja, "ws_CO_c2b_0001").await;

    let h = harness(0, Some(&daraja)).await;
    let snapshot = SettingsSnapshot::default();
    let response = h
        .payments
        .initiate_deposit(&AuthContext::user(h.user_id), &snapshot, deposit(h.user_id, 250))
        .await
        .unwrap();

    let body = c2b_confirmation(
        "RKTQDM7W6S",
        "250.00",
        &format!("EARN-{}", response.transaction.id),
    );
    let outcome = h
        .webhooks
        .process(ProviderName::Mpesa, &snapshot, &body, None)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ReconcileOutcome::Credited { transaction_id, .. } if transaction_id == response.transaction.id
    ));

    let user = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(250));
}

#[tokio::test]
async fn bank_deposit_is_never_settled_by_a_callback() {
    let h = harness(0, None).await;
    let snapshot = all_methods_enabled();

    let response = h
        .payments
        .initiate_deposit(
            &AuthContext::user(h.user_id),
            &snapshot,
            DepositRequest {
                user_id: h.user_id,
                amount: BigDecimal::from(1_000_000),
                phone_number: None,
                provider: "bank".to_string(),
            },
        )
        .await
        .unwrap();
    let id = response.transaction.id;

    let payhero = h
        .webhooks
        .process(ProviderName::PayHero, &snapshot, &payhero_success(id, 1_000_000), None)
        .await
        .unwrap();
    assert_eq!(payhero, ReconcileOutcome::Unmatched);

    let c2b = c2b_confirmation("RKTQBANK01", "1000000.00", &format!("EARN-{}", id));
    let mpesa = h
        .webhooks
        .process(ProviderName::Mpesa, &snapshot, &c2b, None)
        .await
        .unwrap();
    assert_eq!(mpesa, ReconcileOutcome::Unmatched);

    let stored = h.store.find_transaction(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Pending);
    let user = h.store.find_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, BigDecimal::from(0));

    let review = h
        .admin
        .approve_deposit(
            &AuthContext::admin(Uuid::new_v4()),
            id,
            ApprovalRequest {
                user_id: h.user_id,
                amount: BigDecimal::from(1_000_000),
            },
        )
        .await
        .unwrap();
    assert_eq!(review.transaction.status, TransactionStatus::Completed);
}
