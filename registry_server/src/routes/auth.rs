//! Token endpoints for the admin session and for repository build tokens.

use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::error::RegistryResult;
use crate::models::RepoId;
use crate::routes::{bearer_token, reject, AppState};
use crate::services::admin_service::{decode_basic_header, find_refresh_cookie, refresh_cookie};
use crate::services::credentials::AuthError;
use crate::services::key_service;

#[derive(Debug, Serialize)]
pub struct TokenJson {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

/// `GET /token`: Basic credentials, or the refresh cookie when they are
/// absent or empty. The new refresh token only travels in the cookie.
pub async fn admin_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let basic = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| decode_basic_header(v).ok())
        .filter(|(user, pass)| !user.is_empty() && !pass.is_empty());

    let pair = match basic {
        Some((user, pass)) => {
            tracing::info!("Admin token requested with password");
            state.admin.login_password(&user, &pass)
        }
        None => {
            tracing::info!("Admin token requested with refresh cookie");
            headers
                .get(COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(find_refresh_cookie)
                .ok_or(AuthError::Malformed)
                .and_then(|refresh| state.admin.login_refresh(refresh))
        }
    }
    .map_err(|e| reject(e, "admin login"))?;

    let cookie = refresh_cookie(&pair.refresh, state.admin.refresh_max_age_secs());
    let body = Json(TokenJson {
        token: pair.bearer,
        refresh: None,
    });
    Ok(([(SET_COOKIE, cookie)], body).into_response())
}

/// `GET /repo/{ns}/{name}/token`: exchange a repository refresh token.
pub async fn repository_token(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Json<TokenJson>> {
    let id = RepoId::new(namespace, name);
    if !state.registry.store.contains(&id) {
        return Err(reject(AuthError::MissingKey, "repository refresh"));
    }
    let refresh = bearer_token(&headers).map_err(|e| reject(e, "repository refresh"))?;
    let pair =
        key_service::refresh_repository_tokens(&state.registry, &state.repo_codec, &id, &refresh)?;
    Ok(Json(TokenJson {
        token: pair.bearer,
        refresh: Some(pair.refresh),
    }))
}
