//! Admin session credentials.
//!
//! The admin signs in with the configured username and password (or an
//! earlier admin refresh token) and receives an admin-scope pair signed with
//! a secret that only lives as long as the process.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::services::credentials::{
    generate_secret, validate, AuthError, Claims, CredentialCodec, Scope, TokenKind, TokenPair,
};
use crate::services::password::verify_password;

/// Name of the cookie carrying the admin refresh token.
pub const REFRESH_COOKIE: &str = "refresh";

pub struct AdminAuth {
    username: String,
    password_hash: String,
    session_secret: String,
    codec: CredentialCodec,
}

impl AdminAuth {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            session_secret: generate_secret(),
            codec: CredentialCodec::admin(),
        }
    }

    pub fn refresh_max_age_secs(&self) -> i64 {
        self.codec.refresh_period().num_seconds()
    }

    /// Password login. An empty configured hash disables it.
    pub fn login_password(&self, username: &str, password: &str) -> Result<TokenPair, AuthError> {
        if self.password_hash.is_empty()
            || username != self.username
            || !verify_password(password, &self.password_hash)
        {
            return Err(AuthError::BadPassword);
        }
        self.codec.issue_pair(&Scope::Admin, &self.session_secret)
    }

    pub fn login_refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        validate(
            refresh_token,
            &self.session_secret,
            TokenKind::Refresh,
            &Scope::Admin,
        )?;
        self.codec.issue_pair(&Scope::Admin, &self.session_secret)
    }

    pub fn check_bearer(&self, bearer_token: &str) -> Result<Claims, AuthError> {
        validate(
            bearer_token,
            &self.session_secret,
            TokenKind::Bearer,
            &Scope::Admin,
        )
    }
}

/// Splits an `Authorization: Basic base64(user:pass)` header value.
pub fn decode_basic_header(value: &str) -> Result<(String, String), AuthError> {
    let encoded = value
        .strip_prefix("Basic ")
        .ok_or(AuthError::Malformed)?
        .trim();
    let raw = STANDARD.decode(encoded).map_err(|_| AuthError::Malformed)?;
    let pair = String::from_utf8(raw).map_err(|_| AuthError::Malformed)?;
    let (user, pass) = pair.split_once(':').ok_or(AuthError::Malformed)?;
    Ok((user.to_string(), pass.to_string()))
}

/// `Set-Cookie` value for an admin refresh token.
pub fn refresh_cookie(token: &str, max_age_secs: i64) -> String {
    format!("{REFRESH_COOKIE}={token}; HttpOnly; Secure; Path=/; Max-Age={max_age_secs}")
}

/// Value of the refresh cookie in a `Cookie` header, if present.
pub fn find_refresh_cookie(cookie_header: &str) -> Option<&str> {
    cookie_header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == REFRESH_COOKIE)
        .map(|(_, value)| value)
}
