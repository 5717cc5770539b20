//! Scoped bearer/refresh credentials.
//!
//! Repository-scope tokens are signed with the repository's own secret, so
//! rotating that secret invalidates every token issued before. Admin-scope
//! tokens are signed with a per-process session secret.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::models::RepoId;

/// Bearer tokens are short-lived regardless of scope.
pub const BEARER_LIFETIME_MINUTES: i64 = 20;
/// Default refresh period for repository-scope tokens.
pub const DEFAULT_REPOSITORY_REFRESH_DAYS: i64 = 40;
/// Refresh period for the admin session.
pub const ADMIN_REFRESH_HOURS: i64 = 24;

/// Why a credential was rejected. Callers only ever see "Unauthorized".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("signature does not verify")]
    InvalidSignature,
    #[error("claims could not be decoded")]
    Malformed,
    #[error("wrong token kind")]
    WrongKind,
    #[error("token bound to a different scope")]
    ScopeMismatch,
    #[error("token expired")]
    Expired,
    #[error("no signing key for scope")]
    MissingKey,
    #[error("username or password does not match")]
    BadPassword,
}

impl AuthError {
    /// Short label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::Malformed => "malformed",
            Self::WrongKind => "wrong_kind",
            Self::ScopeMismatch => "scope_mismatch",
            Self::Expired => "expired",
            Self::MissingKey => "missing_key",
            Self::BadPassword => "bad_password",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    Repository { namespace: String, name: String },
    Admin,
}

impl Scope {
    pub fn repository(id: &RepoId) -> Self {
        Self::Repository {
            namespace: id.namespace.clone(),
            name: id.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Bearer,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub scope: Scope,
    pub kind: TokenKind,
    /// Expiry, Unix seconds.
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub bearer: String,
    pub refresh: String,
}

/// Looks up the key that verifies a repository's tokens.
pub trait SigningKeyProvider: Send + Sync {
    fn signing_key(&self, repo: &RepoId) -> Option<String>;
}

/// Issues token pairs with a fixed refresh period.
#[derive(Debug, Clone, Copy)]
pub struct CredentialCodec {
    refresh_period: Duration,
}

impl CredentialCodec {
    pub fn repository(refresh_days: i64) -> Self {
        Self {
            refresh_period: Duration::days(refresh_days.max(1)),
        }
    }

    pub fn admin() -> Self {
        Self {
            refresh_period: Duration::hours(ADMIN_REFRESH_HOURS),
        }
    }

    pub fn refresh_period(&self) -> Duration {
        self.refresh_period
    }

    pub fn issue_pair(&self, scope: &Scope, key: &str) -> Result<TokenPair, AuthError> {
        self.issue_pair_at(scope, key, Utc::now())
    }

    pub fn issue_pair_at(
        &self,
        scope: &Scope,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        let bearer = sign(
            &Claims {
                scope: scope.clone(),
                kind: TokenKind::Bearer,
                exp: (now + Duration::minutes(BEARER_LIFETIME_MINUTES)).timestamp(),
            },
            key,
        )?;
        let refresh = sign(
            &Claims {
                scope: scope.clone(),
                kind: TokenKind::Refresh,
                exp: (now + self.refresh_period).timestamp(),
            },
            key,
        )?;
        Ok(TokenPair { bearer, refresh })
    }
}

fn sign(claims: &Claims, key: &str) -> Result<String, AuthError> {
    if key.is_empty() {
        return Err(AuthError::MissingKey);
    }
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(error = %e, "Token signing failed");
        AuthError::Malformed
    })
}

pub fn validate(
    token: &str,
    key: &str,
    expected_kind: TokenKind,
    expected_scope: &Scope,
) -> Result<Claims, AuthError> {
    validate_at(token, key, expected_kind, expected_scope, Utc::now())
}

/// Checks signature, claim shape, kind, scope and expiry, in that order.
pub fn validate_at(
    token: &str,
    key: &str,
    expected_kind: TokenKind,
    expected_scope: &Scope,
    now: DateTime<Utc>,
) -> Result<Claims, AuthError> {
    if key.is_empty() {
        return Err(AuthError::MissingKey);
    }

    // Expiry is checked below, after kind and scope.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(token, &DecodingKey::from_secret(key.as_bytes()), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            _ => AuthError::Malformed,
        })?;
    let claims = data.claims;

    if claims.kind != expected_kind {
        return Err(AuthError::WrongKind);
    }
    if &claims.scope != expected_scope {
        return Err(AuthError::ScopeMismatch);
    }
    if claims.exp <= now.timestamp() {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// Validates a repository-scope token against the repository's current key.
pub fn validate_repository(
    keys: &dyn SigningKeyProvider,
    token: &str,
    repo: &RepoId,
    expected_kind: TokenKind,
) -> Result<Claims, AuthError> {
    let key = keys.signing_key(repo).ok_or(AuthError::MissingKey)?;
    validate(token, &key, expected_kind, &Scope::repository(repo))
}

/// Extracts the JWT from an `Authorization: Bearer <base64(jwt)>` header value.
pub fn decode_bearer_header(value: &str) -> Result<String, AuthError> {
    let encoded = value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::Malformed)?
        .trim();
    let raw = STANDARD.decode(encoded).map_err(|_| AuthError::Malformed)?;
    String::from_utf8(raw).map_err(|_| AuthError::Malformed)
}

/// Encodes a JWT the way clients put it in the `Authorization` header.
#[cfg(test)]
pub fn encode_bearer_header(token: &str) -> String {
    format!("Bearer {}", STANDARD.encode(token))
}

/// Fresh random signing secret, hex encoded.
pub fn generate_secret() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}
