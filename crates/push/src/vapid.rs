use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use thiserror::Error;
use url::Url;

/// Push services reject tokens valid for more than 24 hours.
const TOKEN_LIFETIME_HOURS: i64 = 12;

/// Signs VAPID (RFC 8292) authorization headers for Web Push requests.
#[derive(Clone)]
pub struct VapidSigner {
    key: EncodingKey,
    public_key: String,
    subject: String,
}

#[derive(Debug, Serialize)]
struct VapidClaims<'a> {
    aud: &'a str,
    exp: i64,
    sub: &'a str,
}

impl VapidSigner {
    /// Builds a signer from a PKCS#8 PEM encoded P-256 private key and the
    /// matching base64url public key handed to browsers.
    pub fn from_pem(
        private_key_pem: &str,
        public_key: impl Into<String>,
        subject: impl Into<String>,
    ) -> Result<Self, VapidError> {
        let key = EncodingKey::from_ec_pem(private_key_pem.as_bytes())?;
        Ok(Self {
            key,
            public_key: public_key.into(),
            subject: subject.into(),
        })
    }

    /// Public key as registered with `pushManager.subscribe`.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Returns the value of the `Authorization` header for a push endpoint.
    pub fn authorization(&self, endpoint: &Url, now: DateTime<Utc>) -> Result<String, VapidError> {
        let audience = endpoint.origin().ascii_serialization();
        let claims = VapidClaims {
            aud: &audience,
            exp: (now + Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp(),
            sub: &self.subject,
        };
        let token = encode(&Header::new(Algorithm::ES256), &claims, &self.key)?;
        Ok(format!("vapid t={token}, k={}", self.public_key))
    }
}

/// Errors produced while loading keys or signing tokens.
#[derive(Debug, Error)]
pub enum VapidError {
    #[error("failed to sign vapid token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}
