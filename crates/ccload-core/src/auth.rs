//! Client-facing auth gate: bearer token → SHA-256 → stored token, plus the
//! per-token model whitelist and daily cost cap.

use std::sync::Arc;

use http::HeaderMap;
use time::OffsetDateTime;
use tracing::warn;

use ccload_common::{AuthToken, hash_token};
use ccload_storage::Store;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("missing access token")]
    Missing,
    #[error("invalid access token")]
    Invalid,
    #[error("access token disabled or expired")]
    Inactive,
    #[error("model not allowed for this token")]
    ModelNotAllowed,
    #[error("daily cost limit exhausted")]
    BudgetExhausted,
    #[error("auth backend unavailable")]
    Unavailable,
}

impl AuthFailure {
    pub fn status(&self) -> u16 {
        match self {
            AuthFailure::Missing | AuthFailure::Invalid => 401,
            AuthFailure::Inactive | AuthFailure::ModelNotAllowed => 403,
            AuthFailure::BudgetExhausted => 429,
            AuthFailure::Unavailable => 503,
        }
    }
}

pub struct AuthGate {
    store: Arc<dyn Store>,
}

impl AuthGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthToken, AuthFailure> {
        let plaintext = extract_client_token(headers).ok_or(AuthFailure::Missing)?;
        let hash = hash_token(&plaintext);
        let token = self
            .store
            .get_auth_token_by_hash(&hash)
            .await
            .map_err(|err| {
                warn!(error = %err, "auth token lookup failed");
                AuthFailure::Unavailable
            })?
            .ok_or(AuthFailure::Invalid)?;

        let now_ms = unix_millis();
        if !token.is_valid(now_ms) {
            return Err(AuthFailure::Inactive);
        }
        if let Err(err) = self.store.touch_token_last_used(token.id, now_ms).await {
            warn!(token_id = token.id, error = %err, "last-used update failed");
        }
        Ok(token)
    }

    /// Model whitelist and daily-budget checks, run once the requested model
    /// is known.
    pub fn authorize(&self, token: &AuthToken, model: &str) -> Result<(), AuthFailure> {
        if !token.allows_model(model) {
            return Err(AuthFailure::ModelNotAllowed);
        }
        if token.budget_exhausted() {
            return Err(AuthFailure::BudgetExhausted);
        }
        Ok(())
    }
}

fn unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// `Authorization: Bearer <token>` first, then `x-api-key`.
pub fn extract_client_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
    {
        let raw = raw.trim();
        let prefix = "Bearer ";
        if raw.len() > prefix.len() && raw[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = raw[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = headers.get("x-api-key")
        && let Ok(raw) = value.to_str()
    {
        let raw = raw.trim();
        if !raw.is_empty() {
            return Some(raw.to_string());
        }
    }
    None
}
