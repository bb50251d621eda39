use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{error, info, warn};

use storefront_core::types::{PushMessage, SendPushRequest, SubscribeRequest};
use storefront_push::{PushOutcome, WebPushClient};
use storefront_storage::{
    Database, NewPushMessage, NewPushSubscription, PushMessageError, PushSubscriptionError,
    UpsertOutcome,
};

use crate::problem::ProblemResponse;
use crate::reconcile::Clock;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StagePayload, TapHub};

const DEFAULT_MESSAGE_LIMIT: u32 = 10;
const MAX_MESSAGE_LIMIT: u32 = 50;

/// Sends wake-up pushes to stored subscriptions and prunes the dead ones.
#[derive(Clone)]
pub struct NotificationDispatcher {
    database: Database,
    client: WebPushClient,
    tap: TapHub,
    clock: Clock,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: u32,
    pub removed: u32,
    pub failed: u32,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to load subscriptions: {0}")]
    Subscriptions(#[from] PushSubscriptionError),
}

impl NotificationDispatcher {
    pub fn new(database: Database, client: WebPushClient, tap: TapHub, clock: Clock) -> Self {
        Self {
            database,
            client,
            tap,
            clock,
        }
    }

    /// Pushes to the subscriptions of `user_id`, or to every subscription when `None`.
    ///
    /// Subscriptions are handled one after another; a failed push never stops
    /// the remaining ones.
    pub async fn dispatch(
        &self,
        message: &PushMessage,
        user_id: Option<&str>,
    ) -> Result<DispatchReport, DispatchError> {
        let repo = self.database.push_subscriptions();
        let subscriptions = repo.list(user_id).await?;
        let mut report = DispatchReport::default();

        for subscription in subscriptions {
            let host = endpoint_host(&subscription.endpoint);
            match self.client.send(&subscription.endpoint, (self.clock)()).await {
                Ok(PushOutcome::Delivered) => {
                    counter!("push_dispatch_total", "outcome" => "delivered").increment(1);
                    report.delivered += 1;
                }
                Ok(PushOutcome::Gone) => {
                    counter!("push_dispatch_total", "outcome" => "gone").increment(1);
                    match repo.delete(&subscription.endpoint).await {
                        Ok(_) => {
                            info!(stage = "notify", %host, "removed expired push subscription");
                            report.removed += 1;
                        }
                        Err(err) => {
                            error!(stage = "notify", %host, error = %err, "failed to remove expired push subscription");
                            report.failed += 1;
                        }
                    }
                }
                Err(err) => {
                    counter!("push_dispatch_total", "outcome" => "failed").increment(1);
                    warn!(stage = "notify", %host, error = %err, "push delivery failed");
                    report.failed += 1;
                }
            }
        }

        let mut event = StageEvent::new((self.clock)(), StageKind::Notify);
        event.meta.message = Some(message.id.clone());
        event.r#in = StagePayload::plain(json!({
            "message_id": message.id,
            "broadcast": user_id.is_none(),
        }));
        event.out = StagePayload::plain(json!(report));
        self.tap.publish(event);

        Ok(report)
    }
}

fn endpoint_host(endpoint: &str) -> String {
    reqwest::Url::parse(endpoint)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "invalid".to_string())
}

pub async fn subscribe(
    State(state): State<AppState>,
    payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Response, ProblemResponse> {
    let Json(request) = payload?;
    let user_id = request.validate().map_err(|err| {
        ProblemResponse::bad_request("invalid_subscription", err.to_string())
    })?;

    let subscription = &request.subscription;
    let outcome = state
        .storage()
        .push_subscriptions()
        .upsert(&NewPushSubscription {
            endpoint: subscription.endpoint.trim(),
            user_id,
            p256dh: subscription.keys.p256dh.trim(),
            auth: subscription.keys.auth.trim(),
            at: state.now(),
        })
        .await
        .map_err(|err| {
            error!(stage = "notify", error = %err, "failed to store push subscription");
            ProblemResponse::internal("storage_error", "failed to store subscription")
        })?;

    info!(
        stage = "notify",
        host = %endpoint_host(&subscription.endpoint),
        created = matches!(outcome, UpsertOutcome::Created),
        "push subscription stored"
    );
    Ok((StatusCode::CREATED, Json(json!({ "status": "subscribed" }))).into_response())
}

pub async fn public_key(State(state): State<AppState>) -> Result<Response, ProblemResponse> {
    let client = state.push().ok_or_else(|| {
        ProblemResponse::not_found("push_not_configured", "web push is not configured")
    })?;
    Ok(Json(json!({ "publicKey": client.public_key() })).into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: String,
    #[serde(flatten)]
    report: DispatchReport,
}

pub async fn send(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SendPushRequest>, JsonRejection>,
) -> Result<Response, ProblemResponse> {
    authorize_admin(&state, &headers)?;
    let Json(request) = payload?;

    let title = request.title.trim();
    let body = request.body.trim();
    if title.is_empty() || body.is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_message",
            "title and body are required",
        ));
    }
    let user_id = non_blank(request.user_id.as_deref());

    let message = state
        .storage()
        .push_messages()
        .insert(NewPushMessage {
            user_id,
            title,
            body,
            url: non_blank(request.url.as_deref()),
            created_at: state.now(),
        })
        .await
        .map_err(storage_problem)?;

    let Some(dispatcher) = state.dispatcher() else {
        warn!(stage = "notify", message_id = %message.id, "push message stored but VAPID is not configured");
        return Err(ProblemResponse::unavailable(
            "push_not_configured",
            format!("message {} stored; web push is not configured", message.id),
        ));
    };

    let report = dispatcher
        .dispatch(&message, user_id)
        .await
        .map_err(|err| {
            error!(stage = "notify", message_id = %message.id, error = %err, "push dispatch failed");
            ProblemResponse::internal("storage_error", "failed to load subscriptions")
        })?;

    info!(
        stage = "notify",
        message_id = %message.id,
        delivered = report.delivered,
        removed = report.removed,
        failed = report.failed,
        "push message dispatched"
    );
    Ok(Json(SendResponse {
        message_id: message.id,
        report,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

pub async fn messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Result<Response, ProblemResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .clamp(1, MAX_MESSAGE_LIMIT);
    let messages = state
        .storage()
        .push_messages()
        .list_for_user(non_blank(query.user_id.as_deref()), limit)
        .await
        .map_err(storage_problem)?;
    Ok(Json(json!({ "messages": messages })).into_response())
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ProblemResponse> {
    let Some(expected) = state.admin_token() else {
        return Err(ProblemResponse::forbidden(
            "push_send_disabled",
            "ADMIN_API_TOKEN is not configured",
        ));
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();

    if !provided.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ProblemResponse::unauthorized(
            "unauthorized",
            "a valid bearer token is required",
        ))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn storage_problem(err: PushMessageError) -> ProblemResponse {
    error!(stage = "notify", error = %err, "push message storage failed");
    ProblemResponse::internal("storage_error", "failed to access push messages")
}
