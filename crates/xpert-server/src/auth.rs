//! Authentication
//!
//! Two accepted schemes: a long-lived API key (`x-api-key` header or
//! `Authorization: Bearer <apiKey>`) and a short-lived client secret
//! (`x-client-secret` or `Authorization: Bearer cs-x-…`) issued via
//! `POST /chatkit/sessions`. Client secrets are HMAC-signed over their id
//! and expiry, so validation needs no storage.

use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of issued client secrets
pub const CLIENT_SECRET_PREFIX: &str = "cs-x-";

/// An issued short-lived client secret
#[derive(Debug, Clone, Serialize)]
pub struct ClientSecret {
    pub client_secret: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and validates client secrets
#[derive(Clone)]
pub struct SecretIssuer {
    key: Vec<u8>,
    ttl: Duration,
}

impl SecretIssuer {
    pub fn new(session_secret: &str) -> Self {
        Self {
            key: session_secret.as_bytes().to_vec(),
            ttl: Duration::minutes(15),
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a secret of the form `cs-x-<id>.<expiry>.<signature>`
    pub fn issue(&self) -> ClientSecret {
        let expires_at = Utc::now() + self.ttl;
        let payload = format!("{}.{}", Uuid::new_v4(), expires_at.timestamp());
        let signature = self.sign(&payload);
        ClientSecret {
            client_secret: format!("{CLIENT_SECRET_PREFIX}{payload}.{signature}"),
            expires_at,
        }
    }

    /// Check signature and expiry
    pub fn validate(&self, secret: &str) -> bool {
        let Some(body) = secret.strip_prefix(CLIENT_SECRET_PREFIX) else {
            return false;
        };
        let mut parts = body.rsplitn(2, '.');
        let (Some(signature), Some(payload)) = (parts.next(), parts.next()) else {
            return false;
        };
        if self.sign(payload) != signature {
            return false;
        }
        let expiry = payload
            .rsplit('.')
            .next()
            .and_then(|ts| ts.parse::<i64>().ok());
        match expiry {
            Some(ts) => Utc::now().timestamp() <= ts,
            None => false,
        }
    }
}

/// Extract the bearer credential from a request
fn credential(request: &Request) -> Option<String> {
    let headers = request.headers();
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    if let Some(secret) = headers.get("x-client-secret").and_then(|v| v.to_str().ok()) {
        return Some(secret.to_string());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Request guard validating either scheme. Requests pass when no API keys
/// are configured (development mode).
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, crate::error::ServerError> {
    if state.config.api_keys.is_empty() {
        return Ok(next.run(request).await);
    }

    let Some(credential) = credential(&request) else {
        return Err(crate::error::ServerError::Unauthorized(
            "missing credentials".to_string(),
        ));
    };

    let valid = if credential.starts_with(CLIENT_SECRET_PREFIX) {
        state.secrets.validate(&credential)
    } else {
        state.config.api_keys.iter().any(|k| k == &credential)
    };
    if !valid {
        return Err(crate::error::ServerError::Unauthorized(
            "invalid credentials".to_string(),
        ));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate() {
        let issuer = SecretIssuer::new("test-secret");
        let secret = issuer.issue();
        assert!(secret.client_secret.starts_with(CLIENT_SECRET_PREFIX));
        assert!(issuer.validate(&secret.client_secret));
    }

    #[test]
    fn test_tampered_secret_rejected() {
        let issuer = SecretIssuer::new("test-secret");
        let secret = issuer.issue();
        let tampered = format!("{}x", secret.client_secret);
        assert!(!issuer.validate(&tampered));
    }

    #[test]
    fn test_foreign_key_rejected() {
        let issuer = SecretIssuer::new("test-secret");
        let other = SecretIssuer::new("other-secret");
        let secret = other.issue();
        assert!(!issuer.validate(&secret.client_secret));
    }

    #[test]
    fn test_expired_secret_rejected() {
        let mut issuer = SecretIssuer::new("test-secret");
        issuer.ttl = Duration::seconds(-10);
        let secret = issuer.issue();
        assert!(!issuer.validate(&secret.client_secret));
    }
}
