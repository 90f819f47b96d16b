//! Token Validation
//!
//! Validates bearer tokens presented in the connection handshake. The
//! server never issues tokens — the OAuth code-for-token exchange lives in
//! an external service — it only consumes the [`TokenValidator`] contract.
//! A JWT-based validator is bundled; embedders can plug their own (session
//! stores, introspection endpoints) since validation is async.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::AuthSettings;

/// Identity extracted from a valid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenVerdict {
    /// Server-trusted stable player id.
    pub player_id: String,
    /// Display name.
    pub username: String,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No validation material configured on the server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Audience claim doesn't match the configured client id.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Token decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Pluggable token validation.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Validate a raw token and resolve the connection's identity.
    async fn validate(&self, token: &str) -> Result<TokenVerdict, AuthError>;
}

/// Claims we expect from identity providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject — the provider-scoped user id.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued-at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Audience (OAuth client id).
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Display name, when the provider includes one.
    #[serde(default)]
    pub name: Option<String>,
    /// Email, used as a display-name fallback.
    #[serde(default)]
    pub email: Option<String>,
}

impl TokenClaims {
    /// Derive a stable player id from the subject claim: SHA-256 over a
    /// domain-separated subject, hex-truncated. The same subject always maps
    /// to the same id, so reconnects land on the right slot.
    pub fn player_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"phalanx-player:");
        hasher.update(self.sub.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }

    /// Best available display name.
    pub fn username(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.sub.clone())
    }
}

/// JWT validator over an HS256 shared secret, with optional audience
/// enforcement against the configured OAuth client id.
pub struct JwtValidator {
    settings: AuthSettings,
}

impl JwtValidator {
    /// Build from the engine's auth settings.
    pub fn new(settings: AuthSettings) -> Self {
        Self { settings }
    }

    fn decode_claims(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let secret = self
            .settings
            .secret
            .as_ref()
            .ok_or(AuthError::NotConfigured)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = std::collections::HashSet::new();

        match &self.settings.google_client_id {
            Some(client_id) => validation.set_audience(&[client_id]),
            None => validation.validate_aud = false,
        }

        let key = DecodingKey::from_secret(secret.as_bytes());
        let token_data: TokenData<TokenClaims> =
            decode(token, &key, &validation).map_err(map_jwt_error)?;

        let claims = token_data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub".into()));
        }
        Ok(claims)
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<TokenVerdict, AuthError> {
        let claims = self.decode_claims(token)?;
        Ok(TokenVerdict {
            player_id: claims.player_id(),
            username: claims.username(),
        })
    }
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn create_test_token(claims: &TokenClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn test_claims() -> TokenClaims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        TokenClaims {
            sub: "user123".into(),
            exp: now + 3600,
            iat: now,
            aud: Some(serde_json::json!("game-client")),
            name: Some("Alice".into()),
            email: Some("alice@example.com".into()),
        }
    }

    fn validator(secret: &str, audience: Option<&str>) -> JwtValidator {
        JwtValidator::new(AuthSettings {
            enabled: true,
            allow_anonymous: false,
            google_client_id: audience.map(String::from),
            secret: Some(secret.into()),
        })
    }

    #[tokio::test]
    async fn test_valid_token_accepted() {
        let secret = "test-secret-key-256-bits-long!!";
        let token = create_test_token(&test_claims(), secret);

        let verdict = validator(secret, None).validate(&token).await.unwrap();
        assert_eq!(verdict.username, "Alice");
        assert_eq!(verdict.player_id.len(), 32);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let secret = "test-secret-key-256-bits-long!!";
        let mut claims = test_claims();
        claims.exp = 1;

        let token = create_test_token(&claims, secret);
        let result = validator(secret, None).validate(&token).await;
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected() {
        let token = create_test_token(&test_claims(), "correct-secret-key-here!!!!!");
        let result = validator("wrong-secret-key-here!!!!!!", None)
            .validate(&token)
            .await;
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_audience_enforced() {
        let secret = "test-secret-key-256-bits-long!!";
        let token = create_test_token(&test_claims(), secret);

        let ok = validator(secret, Some("game-client")).validate(&token).await;
        assert!(ok.is_ok());

        let bad = validator(secret, Some("other-client")).validate(&token).await;
        assert!(matches!(bad, Err(AuthError::InvalidAudience)));
    }

    #[tokio::test]
    async fn test_missing_sub_rejected() {
        let secret = "test-secret-key-256-bits-long!!";
        let mut claims = test_claims();
        claims.sub = String::new();

        let token = create_test_token(&claims, secret);
        let result = validator(secret, None).validate(&token).await;
        assert!(matches!(result, Err(AuthError::MissingClaim(_))));
    }

    #[tokio::test]
    async fn test_not_configured_error() {
        let v = JwtValidator::new(AuthSettings {
            enabled: true,
            ..Default::default()
        });
        let result = v.validate("some.jwt.token").await;
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_player_id_derivation_is_stable() {
        let claims = test_claims();
        assert_eq!(claims.player_id(), claims.player_id());

        let other = TokenClaims {
            sub: "user456".into(),
            ..test_claims()
        };
        assert_ne!(claims.player_id(), other.player_id());
    }

    #[test]
    fn test_username_fallbacks() {
        let mut claims = test_claims();
        assert_eq!(claims.username(), "Alice");

        claims.name = None;
        assert_eq!(claims.username(), "alice@example.com");

        claims.email = None;
        assert_eq!(claims.username(), "user123");
    }
}
