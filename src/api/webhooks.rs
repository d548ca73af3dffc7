//! Gateway notification endpoints.
//!
//! Every delivery is acknowledged in the shape its gateway expects, even when
//! processing fails internally, so gateways do not retry forever. Only a
//! failed signature check is answered with 401.

use crate::api::AppState;
use crate::error::ErrorCode;
use crate::middleware::error::{get_request_id_from_headers, json_error_response};
use crate::payments::providers::lipana::SIGNATURE_HEADER as LIPANA_SIGNATURE_HEADER;
use crate::payments::types::ProviderName;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value as JsonValue};
use tracing::{error, info, warn};

fn daraja_ack() -> JsonValue {
    json!({ "ResultCode": 0, "ResultDesc": "Accepted" })
}

/// POST /api/mpesa/callback
pub async fn mpesa_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(&state, ProviderName::Mpesa, &headers, &body, None, daraja_ack()).await
}

/// POST /api/mpesa/c2b/confirmation
pub async fn c2b_confirmation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(&state, ProviderName::Mpesa, &headers, &body, None, daraja_ack()).await
}

/// POST /api/mpesa/c2b/validation
///
/// Paybill payments are always accepted. Matching happens on confirmation.
pub async fn c2b_validation(headers: HeaderMap, body: Bytes) -> Json<JsonValue> {
    let bill_ref = serde_json::from_slice::<JsonValue>(&body)
        .ok()
        .and_then(|v| v.get("BillRefNumber").and_then(|r| r.as_str()).map(str::to_string));
    info!(
        request_id = ?get_request_id_from_headers(&headers),
        bill_ref = ?bill_ref,
        "c2b validation accepted"
    );
    Json(daraja_ack())
}

/// POST /api/payments/callback
pub async fn payments_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(
        &state,
        ProviderName::PayHero,
        &headers,
        &body,
        None,
        json!({ "success": true }),
    )
    .await
}

/// POST /api/webhooks/lipana
pub async fn lipana_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(
        &state,
        ProviderName::Lipana,
        &headers,
        &body,
        Some(LIPANA_SIGNATURE_HEADER),
        json!({ "received": true }),
    )
    .await
}

async fn handle(
    state: &AppState,
    provider: ProviderName,
    headers: &HeaderMap,
    body: &[u8],
    signature_header: Option<&str>,
    ack: JsonValue,
) -> Response {
    let request_id = get_request_id_from_headers(headers);
    let signature = signature_header
        .and_then(|name| headers.get(name))
        .and_then(|v| v.to_str().ok());

    info!(provider = %provider, bytes = body.len(), "Received webhook");

    let snapshot = state.settings.snapshot().await;
    match state
        .webhooks
        .process(provider, &snapshot, body, signature)
        .await
    {
        Ok(outcome) => {
            info!(provider = %provider, outcome = ?outcome, "Webhook processed");
        }
        Err(e) if e.is_signature_failure() => {
            warn!(provider = %provider, error = %e, "Webhook signature rejected");
            return json_error_response(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Unauthorized,
                "invalid webhook signature",
                request_id,
            )
            .into_response();
        }
        Err(e) => {
            error!(provider = %provider, error = %e, "Webhook processing failed, acknowledging");
        }
    }

    (StatusCode::OK, Json(ack)).into_response()
}
