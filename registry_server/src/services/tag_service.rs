//! Release tags on builds.

use chrono::Utc;

use crate::error::{RegistryError, RegistryResult};
use crate::models::{RepoId, Tag};
use crate::registry::Registry;
use crate::services::reconciler::reconcile_locked;

/// Commit alias that resolves to the repository's latest build.
pub const LATEST: &str = "latest";

/// Merge `incoming` into the named tag of a build and persist it.
pub async fn set_tag(
    registry: &Registry,
    id: &RepoId,
    commit: &str,
    tag_name: &str,
    incoming: Tag,
) -> RegistryResult<Tag> {
    if tag_name.is_empty() {
        return Err(RegistryError::invalid("Empty tag name"));
    }
    let _guard = registry.store.lock(id).await;
    reconcile_locked(registry, id, Utc::now()).await?;

    let mut repo = registry
        .store
        .get(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))?;
    let build = repo
        .builds
        .get_mut(commit)
        .ok_or_else(|| RegistryError::not_found(format!("Build not found: {id}@{commit}")))?;

    let tag = build.tags.entry(tag_name.to_string()).or_default();
    tag.merge(incoming);
    let merged = tag.clone();

    registry.store.upsert(repo);
    registry.store.snapshot().await?;
    tracing::info!(
        namespace = %id.namespace,
        name = %id.name,
        commit = %commit,
        tag = %tag_name,
        ready = merged.ready,
        "Tag updated"
    );
    Ok(merged)
}

/// Read a tag. An unknown tag on a known build is the zero tag.
pub fn get_tag(
    registry: &Registry,
    id: &RepoId,
    commit: &str,
    tag_name: &str,
) -> RegistryResult<Tag> {
    let repo = registry
        .store
        .get(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))?;
    let commit = if commit == LATEST {
        repo.latest_build
            .as_deref()
            .ok_or_else(|| RegistryError::not_found(format!("No builds in {id}")))?
    } else {
        commit
    };
    let build = repo
        .builds
        .get(commit)
        .ok_or_else(|| RegistryError::not_found(format!("Build not found: {id}@{commit}")))?;
    Ok(build.tags.get(tag_name).cloned().unwrap_or_default())
}
