//! Registry HTTP routes — public reads, build-token writes, admin.

pub mod api;
pub mod auth;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::error::RegistryError;
use crate::models::RepoId;
use crate::registry::Registry;
use crate::services::admin_service::AdminAuth;
use crate::services::credentials::{
    decode_bearer_header, validate_repository, AuthError, CredentialCodec, TokenKind,
};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub admin: Arc<AdminAuth>,
    pub repo_codec: CredentialCodec,
    pub builds_per_page: usize,
    pub max_upload_bytes: usize,
}

/// Build the registry's Axum router.
pub fn registry_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/token", get(auth::admin_token))
        .route("/repo/{namespace}/{name}", get(api::repo_info))
        .route("/repo/{namespace}/{name}/token", get(auth::repository_token))
        .route("/repo/{namespace}/{name}/builds/{page}", get(api::list_builds))
        .route("/repo/{namespace}/{name}/build/{commit}", get(api::get_build))
        .route("/repo/{namespace}/{name}/build/{commit}/{file}", get(api::get_build_file))
        .route("/repo/{namespace}/{name}/latest", get(api::get_latest))
        .route("/repo/{namespace}/{name}/latest/file/{query}", get(api::get_latest_file))
        .route("/repo/{namespace}/{name}/tag/{commit}/{tag}", get(api::get_tag));

    let build = Router::new()
        .route("/repo/{namespace}/{name}/commit/{commit}/add", post(api::upload))
        .route("/repo/{namespace}/{name}/commit/{commit}/tag", post(api::set_default_tag))
        .route("/repo/{namespace}/{name}/commit/{commit}/tag/{tag}", post(api::set_tag))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_build_token))
        .layer(DefaultBodyLimit::max(state.max_upload_bytes));

    let admin = Router::new()
        .route("/repo/{namespace}/{name}/key", post(api::new_key))
        .route("/repos", get(api::list_repos))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    Router::new()
        .merge(public)
        .merge(build)
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Log a credential failure and collapse it to a generic 401.
pub(crate) fn reject(err: AuthError, context: &str) -> RegistryError {
    tracing::warn!(reason = err.reason(), context, "Credential rejected");
    crate::metrics::auth_failed(err.reason());
    RegistryError::Unauthorized(err)
}

pub(crate) fn bearer_token(req_headers: &axum::http::HeaderMap) -> Result<String, AuthError> {
    let value = req_headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Malformed)?;
    decode_bearer_header(value)
}

async fn require_admin_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, RegistryError> {
    let token = bearer_token(req.headers()).map_err(|e| reject(e, "admin"))?;
    state
        .admin
        .check_bearer(&token)
        .map_err(|e| reject(e, "admin"))?;
    Ok(next.run(req).await)
}

async fn require_build_token(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
    next: Next,
) -> Result<Response, RegistryError> {
    let id = RepoId::new(
        params.get("namespace").cloned().unwrap_or_default(),
        params.get("name").cloned().unwrap_or_default(),
    );
    if !state.registry.store.contains(&id) {
        return Err(reject(AuthError::MissingKey, "build"));
    }
    let token = bearer_token(req.headers()).map_err(|e| reject(e, "build"))?;
    validate_repository(state.registry.store.as_ref(), &token, &id, TokenKind::Bearer)
        .map_err(|e| reject(e, "build"))?;
    Ok(next.run(req).await)
}
