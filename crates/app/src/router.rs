use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use storefront_push::WebPushClient;
use storefront_storage::Database;

use crate::notify::{self, NotificationDispatcher};
use crate::reconcile::{Clock, OrderReconciler};
use crate::tap::{parse_stage_list, tap_keep_alive, tap_stream, TapFilter, TapHub};
use crate::{telemetry, webhook};

/// Signature handling for carrier webhooks.
#[derive(Clone, Default)]
pub struct WebhookSettings {
    /// Shared HMAC secret. `None` skips verification entirely.
    pub secret: Option<Arc<[u8]>>,
    /// Reject deliveries whose signature does not verify instead of only logging them.
    pub enforce_signature: bool,
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tap: TapHub,
    storage: Database,
    webhook: WebhookSettings,
    admin_token: Option<Arc<str>>,
    push: Option<WebPushClient>,
    clock: Clock,
    reconciler: OrderReconciler,
    dispatcher: Option<NotificationDispatcher>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        tap: TapHub,
        storage: Database,
        webhook: WebhookSettings,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let reconciler = OrderReconciler::new(storage.clone(), tap.clone(), clock.clone());
        Self {
            metrics,
            tap,
            storage,
            webhook,
            admin_token: None,
            push: None,
            clock,
            reconciler,
            dispatcher: None,
        }
    }

    /// Enables the admin push endpoint behind a bearer token.
    pub fn with_admin_token(mut self, token: &str) -> Self {
        self.admin_token = Some(Arc::from(token));
        self
    }

    /// Enables web push delivery.
    pub fn with_push(mut self, client: WebPushClient) -> Self {
        self.dispatcher = Some(NotificationDispatcher::new(
            self.storage.clone(),
            client.clone(),
            self.tap.clone(),
            self.clock.clone(),
        ));
        self.push = Some(client);
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock.clone();
        self.reconciler = OrderReconciler::new(self.storage.clone(), self.tap.clone(), clock);
        match self.push.take() {
            Some(client) => self.with_push(client),
            None => self,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tap(&self) -> &TapHub {
        &self.tap
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook(&self) -> &WebhookSettings {
        &self.webhook
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    pub fn push(&self) -> Option<&WebPushClient> {
        self.push.as_ref()
    }

    pub fn now(&self) -> chrono::DateTime<Utc> {
        (self.clock)()
    }

    pub fn reconciler(&self) -> &OrderReconciler {
        &self.reconciler
    }

    pub fn dispatcher(&self) -> Option<&NotificationDispatcher> {
        self.dispatcher.as_ref()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/tap", get(debug_tap))
        .route(
            "/webhooks/yalidine",
            get(webhook::challenge).post(webhook::receive),
        )
        .route("/api/push/subscribe", post(notify::subscribe))
        .route("/api/push/public-key", get(notify::public_key))
        .route("/api/push/send", post(notify::send))
        .route("/api/push/messages", get(notify::messages))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    #[serde(default)]
    s: Option<String>,
}

async fn debug_tap(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    (StatusCode, String),
> {
    let stages = parse_stage_list(query.s).map_err(|err| (StatusCode::BAD_REQUEST, err))?;
    let filter = TapFilter::from_stages(stages);
    let stream = tap_stream(state.tap().clone(), filter);

    Ok(Sse::new(stream).keep_alive(tap_keep_alive()))
}
