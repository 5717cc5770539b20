//! Repository secrets and repository-scope token issuance.

use crate::error::{RegistryError, RegistryResult};
use crate::models::RepoId;
use crate::registry::Registry;
use crate::services::credentials::{
    generate_secret, validate_repository, CredentialCodec, Scope, SigningKeyProvider, TokenKind,
    TokenPair,
};
use crate::services::reconciler::sync_repositories;

/// Create or rotate a repository's secret and return a refresh token for it.
///
/// Discovery runs first so a repository the CI engine just activated is
/// found. A secret is generated when `rotate` is set or none exists yet.
pub async fn issue_repository_key(
    registry: &Registry,
    codec: &CredentialCodec,
    id: &RepoId,
    rotate: bool,
) -> RegistryResult<String> {
    if let Err(e) = sync_repositories(registry).await {
        tracing::warn!(error = %e, "Discovery before key issue failed");
    }

    let _guard = registry.store.lock(id).await;
    let mut repo = registry
        .store
        .get(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))?;

    if rotate || !repo.has_secret() {
        repo.secret = Some(generate_secret());
        registry.store.upsert(repo);
        registry.store.snapshot().await?;
        tracing::info!(
            namespace = %id.namespace,
            name = %id.name,
            rotated = rotate,
            "Repository secret issued"
        );
    }

    let key = registry
        .store
        .signing_key(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))?;
    let pair = codec.issue_pair(&Scope::repository(id), &key)?;
    Ok(pair.refresh)
}

/// Exchange a repository refresh token for a new bearer and refresh pair.
pub fn refresh_repository_tokens(
    registry: &Registry,
    codec: &CredentialCodec,
    id: &RepoId,
    refresh_token: &str,
) -> RegistryResult<TokenPair> {
    validate_repository(registry.store.as_ref(), refresh_token, id, TokenKind::Refresh).map_err(
        |e| {
            tracing::warn!(
                namespace = %id.namespace,
                name = %id.name,
                reason = e.reason(),
                "Repository refresh rejected"
            );
            crate::metrics::auth_failed(e.reason());
            e
        },
    )?;
    let key = registry
        .store
        .signing_key(id)
        .ok_or(crate::services::credentials::AuthError::MissingKey)?;
    Ok(codec.issue_pair(&Scope::repository(id), &key)?)
}
