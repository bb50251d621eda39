use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::vapid::{VapidError, VapidSigner};

/// How long push services should keep an undelivered message, in seconds.
pub const DEFAULT_TTL_SECS: u32 = 24 * 60 * 60;

/// Client delivering payload-less Web Push messages.
///
/// The push only wakes the service worker; the notification content is
/// fetched from the storefront API afterwards, so no message encryption is
/// needed.
#[derive(Clone)]
pub struct WebPushClient {
    http: Client,
    signer: VapidSigner,
    ttl_secs: u32,
}

/// Result of a push attempt the caller has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The push service no longer knows the subscription (404/410).
    Gone,
}

impl WebPushClient {
    /// Creates a new client with the provided HTTP instance and signer.
    pub fn new(http: Client, signer: VapidSigner) -> Self {
        Self {
            http,
            signer,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u32) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn public_key(&self) -> &str {
        self.signer.public_key()
    }

    /// Sends a push to a subscription endpoint.
    pub async fn send(&self, endpoint: &str, now: DateTime<Utc>) -> Result<PushOutcome, PushError> {
        let url = Url::parse(endpoint)?;
        let authorization = self.signer.authorization(&url, now)?;

        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, authorization)
            .header("TTL", self.ttl_secs.to_string())
            .header("Urgency", "normal")
            .body(Vec::<u8>::new())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(PushOutcome::Delivered);
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(PushOutcome::Gone);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        Err(PushError::Status { status, body })
    }
}

/// Errors produced by the push client.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid subscription endpoint: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Vapid(#[from] VapidError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_keys::{PRIVATE_PEM, PUBLIC_KEY_B64};
    use httpmock::prelude::*;

    fn client() -> WebPushClient {
        let signer = VapidSigner::from_pem(PRIVATE_PEM, PUBLIC_KEY_B64, "mailto:ops@example.com")
            .expect("signer");
        WebPushClient::new(Client::builder().build().expect("client"), signer)
    }

    #[tokio::test]
    async fn send_posts_signed_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/push/abc")
                    .header("TTL", "86400")
                    .header("Urgency", "normal")
                    .header_exists("Authorization");
                then.status(201);
            })
            .await;

        let outcome = client()
            .send(&server.url("/push/abc"), Utc::now())
            .await
            .expect("send");
        mock.assert_async().await;
        assert_eq!(outcome, PushOutcome::Delivered);
    }

    #[tokio::test]
    async fn expired_subscription_is_reported_gone() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/push/expired");
                then.status(410).body("push subscription has unsubscribed or expired");
            })
            .await;

        let outcome = client()
            .with_ttl(60)
            .send(&server.url("/push/expired"), Utc::now())
            .await
            .expect("gone is not an error");
        assert_eq!(outcome, PushOutcome::Gone);
    }

    #[tokio::test]
    async fn server_error_returns_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/push/broken");
                then.status(500).body("boom");
            })
            .await;

        let err = client()
            .send(&server.url("/push/broken"), Utc::now())
            .await
            .expect_err("should error");
        match err {
            PushError::Status { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        let err = client()
            .send("not a url", Utc::now())
            .await
            .expect_err("should error");
        assert!(matches!(err, PushError::Url(_)));
    }
}
