mod maintenance;
mod notify;
mod problem;
mod reconcile;
mod router;
mod tap;
mod telemetry;
mod webhook;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tracing::{info, warn};

use storefront_push::{VapidSigner, WebPushClient};
use storefront_storage::Database;
use storefront_util::{load_env_file, AppConfig};

const PUSH_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let tap_hub = tap::TapHub::new();

    if config.webhook_secret.is_none() {
        warn!(stage = "app", "YALIDINE_WEBHOOK_SECRET unset; webhook signatures are not verified");
    }
    let webhook = router::WebhookSettings {
        secret: config
            .webhook_secret
            .as_deref()
            .map(|secret| Arc::from(secret.as_bytes())),
        enforce_signature: config.enforce_signature,
    };

    let mut state = router::AppState::new(metrics, tap_hub.clone(), database.clone(), webhook);
    if let Some(token) = config.admin_token.as_deref() {
        state = state.with_admin_token(token);
    }
    match &config.vapid {
        Some(vapid) => {
            let signer = VapidSigner::from_pem(
                &vapid.private_key_pem,
                vapid.public_key.clone(),
                vapid.subject.clone(),
            )?;
            let http = reqwest::Client::builder()
                .timeout(PUSH_HTTP_TIMEOUT)
                .build()?;
            state = state.with_push(WebPushClient::new(http, signer));
        }
        None => warn!(stage = "app", "VAPID keys not configured; web push disabled"),
    }

    maintenance::MaintenanceWorker::new(database, tap_hub).spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
