use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use storefront_core::normalizer::{NormalizedBatch, Normalizer};
use storefront_storage::{NewWebhookDelivery, SignatureCheck};

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StageMetadata, StagePayload};

pub const HEADER_SIGNATURE: &str = "x-yalidine-signature";
const PROVIDER: &str = "yalidine";

#[derive(Debug, Deserialize)]
pub struct ChallengeQuery {
    #[serde(default)]
    subscribe: Option<String>,
    #[serde(default)]
    crc_token: Option<String>,
}

/// Subscription handshake: echoes `crc_token` back verbatim.
pub async fn challenge(
    Query(query): Query<ChallengeQuery>,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    counter!("webhook_ingress_total", "method" => "get").increment(1);

    let result = match query.crc_token.filter(|token| !token.is_empty()) {
        Some(token) => {
            info!(
                stage = "ingress",
                subscribe = query.subscribe.as_deref().unwrap_or_default(),
                "webhook challenge answered"
            );
            Ok(text_response(token))
        }
        // A GET without a token is a broken handshake, not a wrong method: 400, not 405.
        None => Err(ProblemResponse::bad_request(
            "missing_crc_token",
            "crc_token query parameter is required",
        )),
    };

    histogram!("webhook_ack_latency_seconds", "method" => "get")
        .record(start.elapsed().as_secs_f64());
    result
}

/// Event delivery: verifies, logs and reconciles every parcel update in the batch.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    counter!("webhook_ingress_total", "method" => "post").increment(1);

    let result = process_delivery(&state, &headers, &body, start).await;

    histogram!("webhook_ack_latency_seconds", "method" => "post")
        .record(start.elapsed().as_secs_f64());
    result
}

async fn process_delivery(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    start: Instant,
) -> Result<Response, ProblemResponse> {
    let signature = check_signature(state, headers, body);
    if matches!(signature, SignatureCheck::Invalid | SignatureCheck::Missing) {
        counter!("webhook_invalid_signature_total", "reason" => signature.as_str()).increment(1);
        if state.webhook().enforce_signature {
            warn!(
                stage = "ingress",
                signature = signature.as_str(),
                "rejecting webhook delivery with bad signature"
            );
            return Err(ProblemResponse::forbidden(
                "invalid_signature",
                "webhook signature did not verify",
            ));
        }
        warn!(
            stage = "ingress",
            signature = signature.as_str(),
            "webhook signature did not verify; processing anyway"
        );
    }

    let batch = Normalizer::normalize_bytes(body).map_err(|err| {
        error!(stage = "ingress", error = %err, size_bytes = body.len(), "unreadable webhook payload");
        ProblemResponse::internal("invalid_payload", err.to_string())
    })?;

    record_delivery(state, &batch, signature, body).await;
    emit_tap(state, &batch, signature, body.len() as u64, start);

    for update in &batch.updates {
        if let Err(err) = state.reconciler().apply(update).await {
            counter!("orders_reconciled_total", "outcome" => "error").increment(1);
            error!(
                stage = "reconcile",
                tracking = %update.tracking,
                status = %update.status,
                error = %err,
                "failed to reconcile parcel update"
            );
        }
    }

    if batch.skipped > 0 {
        debug!(
            stage = "ingress",
            skipped = batch.skipped,
            event_type = %batch.event_type,
            "events without tracking or status skipped"
        );
    }

    Ok(text_response("OK".to_string()))
}

fn check_signature(state: &AppState, headers: &HeaderMap, body: &[u8]) -> SignatureCheck {
    let Some(secret) = state.webhook().secret.as_deref() else {
        debug!(stage = "ingress", "webhook secret unset; signature not checked");
        return SignatureCheck::Skipped;
    };
    let Some(provided) = headers
        .get(HEADER_SIGNATURE)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
    else {
        return SignatureCheck::Missing;
    };

    match verify_signature(secret, body, provided) {
        Ok(()) => SignatureCheck::Valid,
        Err(reason) => {
            debug!(stage = "ingress", %reason, "signature mismatch");
            SignatureCheck::Invalid
        }
    }
}

fn verify_signature(secret: &[u8], body: &[u8], provided: &str) -> Result<(), String> {
    let provided = provided.trim();
    let hex_part = provided.strip_prefix("sha256=").unwrap_or(provided);
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

async fn record_delivery(
    state: &AppState,
    batch: &NormalizedBatch,
    signature: SignatureCheck,
    body: &[u8],
) {
    let payload = String::from_utf8_lossy(body);
    let record = NewWebhookDelivery {
        provider: PROVIDER,
        event_type: &batch.event_type,
        event_count: batch.event_count() as i64,
        signature,
        payload_json: &payload,
        received_at: state.now(),
    };
    if let Err(err) = state.storage().webhook_deliveries().insert(record).await {
        error!(stage = "ingress", error = %err, "failed to log webhook delivery");
    }
}

fn emit_tap(
    state: &AppState,
    batch: &NormalizedBatch,
    signature: SignatureCheck,
    body_len: u64,
    start: Instant,
) {
    let mut event = StageEvent::new(state.now(), StageKind::Ingress);
    event.meta = StageMetadata {
        event_type: Some(batch.event_type.clone()),
        size_bytes: Some(body_len),
        latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
        ..StageMetadata::default()
    };
    event.r#in = StagePayload {
        redacted: true,
        payload: json!({ "signature": signature.as_str() }),
    };
    event.out = StagePayload::plain(json!({
        "updates": batch.updates.len(),
        "skipped": batch.skipped,
    }));
    state.tap().publish(event);
}

fn text_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}
