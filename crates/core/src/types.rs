use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order as seen by the delivery reconciliation flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_center_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Browser push subscription registered by a storefront client.
///
/// Pushes are sent without a payload, so `p256dh` and `auth` are only stored;
/// they are kept for a future encrypted-payload path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub p256dh: String,
    pub auth: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Notification content fetched by the service worker after a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Body posted by the browser when it subscribes to push notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    pub subscription: SubscriptionPayload,
}

/// `PushSubscription.toJSON()` shape produced by browsers.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Errors raised when a subscribe request is structurally valid JSON but unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription endpoint is required")]
    MissingEndpoint,
    #[error("subscription endpoint must be an https URL")]
    InsecureEndpoint,
    #[error("subscription key '{0}' is required")]
    MissingKey(&'static str),
}

impl SubscribeRequest {
    /// Checks the request and returns the user id with blanks collapsed to `None`.
    pub fn validate(&self) -> Result<Option<&str>, SubscriptionError> {
        let endpoint = self.subscription.endpoint.trim();
        if endpoint.is_empty() {
            return Err(SubscriptionError::MissingEndpoint);
        }
        if !endpoint.starts_with("https://") {
            return Err(SubscriptionError::InsecureEndpoint);
        }
        if self.subscription.keys.p256dh.trim().is_empty() {
            return Err(SubscriptionError::MissingKey("p256dh"));
        }
        if self.subscription.keys.auth.trim().is_empty() {
            return Err(SubscriptionError::MissingKey("auth"));
        }
        Ok(self
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty()))
    }
}

/// Body accepted by the admin push endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPushRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> SubscribeRequest {
        serde_json::from_value(value).expect("subscribe request")
    }

    #[test]
    fn accepts_browser_subscription_shape() {
        let req = request(json!({
            "userId": " user-1 ",
            "subscription": {
                "endpoint": "https://fcm.googleapis.com/fcm/send/abc",
                "expirationTime": null,
                "keys": {"p256dh": "BKey", "auth": "secret"}
            }
        }));
        assert_eq!(req.validate(), Ok(Some("user-1")));
    }

    #[test]
    fn anonymous_subscription_has_no_user() {
        let req = request(json!({
            "userId": "",
            "subscription": {
                "endpoint": "https://push.example/1",
                "keys": {"p256dh": "BKey", "auth": "secret"}
            }
        }));
        assert_eq!(req.validate(), Ok(None));
    }

    #[test]
    fn rejects_incomplete_subscriptions() {
        let missing_endpoint = request(json!({
            "subscription": {"endpoint": " ", "keys": {"p256dh": "k", "auth": "a"}}
        }));
        assert_eq!(missing_endpoint.validate(), Err(SubscriptionError::MissingEndpoint));

        let insecure = request(json!({
            "subscription": {"endpoint": "http://push.example/1", "keys": {"p256dh": "k", "auth": "a"}}
        }));
        assert_eq!(insecure.validate(), Err(SubscriptionError::InsecureEndpoint));

        let missing_auth = request(json!({
            "subscription": {"endpoint": "https://push.example/1", "keys": {"p256dh": "k", "auth": ""}}
        }));
        assert_eq!(missing_auth.validate(), Err(SubscriptionError::MissingKey("auth")));
    }
}
