//! Artifact ingest and retrieval.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::{RegistryError, RegistryResult};
use crate::models::{Build, RepoId, Repository};
use crate::registry::Registry;
use crate::services::credentials::generate_secret;
use crate::services::reconciler::{reconcile_locked, refresh_latest};
use crate::storage::{blob_path, BlobEntry};

/// One uploaded file, already streamed into the blob store's staging area.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    /// Staging name returned by `BlobStore::stage`.
    pub staged: String,
    pub size: u64,
}

/// Drop staging files of an upload that was not stored.
pub async fn discard_upload(registry: &Registry, files: &[UploadedFile]) {
    for file in files {
        if let Err(e) = registry.blobs.discard_staged(&file.staged).await {
            tracing::warn!(file = %file.name, error = %e, "Failed to remove staged upload");
        }
    }
}

/// Reject anything that is not a single, plain path segment.
pub fn check_segment(what: &str, value: &str) -> RegistryResult<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
    {
        return Err(RegistryError::invalid(format!("Invalid {what}: {value:?}")));
    }
    Ok(())
}

pub async fn ingest(
    registry: &Registry,
    id: &RepoId,
    commit: &str,
    files: Vec<UploadedFile>,
) -> RegistryResult<Build> {
    ingest_at(registry, id, commit, files, Utc::now()).await
}

/// Move staged `files` into the commit's directory and record the change on
/// its build. Unknown repositories are looked up in the CI source and
/// created with a fresh secret. Staging files are removed if the upload
/// fails.
pub async fn ingest_at(
    registry: &Registry,
    id: &RepoId,
    commit: &str,
    files: Vec<UploadedFile>,
    now: DateTime<Utc>,
) -> RegistryResult<Build> {
    let result = store_upload(registry, id, commit, &files, now).await;
    if result.is_err() {
        discard_upload(registry, &files).await;
    }
    result
}

async fn store_upload(
    registry: &Registry,
    id: &RepoId,
    commit: &str,
    files: &[UploadedFile],
    now: DateTime<Utc>,
) -> RegistryResult<Build> {
    check_segment("namespace", &id.namespace)?;
    check_segment("name", &id.name)?;
    check_segment("commit", commit)?;
    if files.is_empty() {
        return Err(RegistryError::invalid("No files in upload"));
    }
    for file in files {
        check_segment("file name", &file.name)?;
    }

    let _guard = registry.store.lock(id).await;

    if !registry.store.contains(id) {
        let found = registry
            .source
            .repository(&id.namespace, &id.name)
            .await
            .map_err(|e| {
                tracing::warn!(
                    namespace = %id.namespace,
                    name = %id.name,
                    error = %e,
                    "Upload for repository unknown to CI source"
                );
                RegistryError::not_found(format!("Repository not found: {id}"))
            })?;
        let mut repo = Repository::new(id, found.link);
        repo.secret = Some(generate_secret());
        registry.store.upsert(repo);
        tracing::info!(
            namespace = %id.namespace,
            name = %id.name,
            "Created repository on first upload"
        );
    }

    reconcile_locked(registry, id, now).await?;

    let dir = blob_path(&[id.namespace.as_str(), id.name.as_str(), commit]);
    registry.blobs.create_dir(&dir).await?;
    for file in files {
        registry
            .blobs
            .commit_staged(&file.staged, &blob_path(&[dir.as_str(), file.name.as_str()]))
            .await?;
    }

    let mut repo = registry
        .store
        .get(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))?;
    let build = repo
        .builds
        .entry(commit.to_string())
        .or_insert_with(|| Build::unlisted(now));
    build.artifact_path = Some(dir);
    build.last_artifact_change = Some(now);
    let stored = build.clone();

    refresh_latest(&mut repo, registry.blobs.as_ref()).await;
    registry.store.upsert(repo);
    registry.store.snapshot().await?;

    crate::metrics::upload_received(files.len());
    tracing::info!(
        namespace = %id.namespace,
        name = %id.name,
        commit = %commit,
        files = files.len(),
        bytes = files.iter().map(|f| f.size).sum::<u64>(),
        "Stored artifacts"
    );
    Ok(stored)
}

/// Files currently stored for a build. A missing directory lists as empty.
pub async fn build_files(registry: &Registry, build: &Build) -> Vec<BlobEntry> {
    let Some(path) = build.artifact_path.as_deref() else {
        return Vec::new();
    };
    registry.blobs.list_dir(path).await.unwrap_or_default()
}

/// First file of the latest non-empty build whose name contains `query`,
/// ignoring case. Returns the file name and its absolute path.
pub async fn find_latest_file(
    registry: &Registry,
    id: &RepoId,
    query: &str,
) -> RegistryResult<(String, PathBuf)> {
    if query.is_empty() {
        return Err(RegistryError::invalid("Empty file query"));
    }
    let repo = registry
        .store
        .get(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))?;
    let (commit, build) = repo
        .latest_non_empty()
        .ok_or_else(|| RegistryError::not_found(format!("No builds with artifacts in {id}")))?;

    let needle = query.to_lowercase();
    let file = build_files(registry, build)
        .await
        .into_iter()
        .find(|f| f.name.to_lowercase().contains(&needle))
        .ok_or_else(|| {
            RegistryError::not_found(format!("No file matching {query:?} in {id}@{commit}"))
        })?;

    let dir = build.artifact_path.as_deref().unwrap_or_default();
    let path = registry.blobs.absolute(&blob_path(&[dir, file.name.as_str()]));
    Ok((file.name, path))
}

/// Absolute path of one stored artifact file.
pub async fn resolve_file(
    registry: &Registry,
    id: &RepoId,
    commit: &str,
    file: &str,
) -> RegistryResult<PathBuf> {
    check_segment("commit", commit)?;
    check_segment("file name", file)?;
    let repo = registry
        .store
        .get(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))?;
    let dir = repo
        .builds
        .get(commit)
        .and_then(|b| b.artifact_path.clone())
        .ok_or_else(|| RegistryError::not_found(format!("No artifacts for {id}@{commit}")))?;

    let relative = blob_path(&[dir.as_str(), file]);
    if !registry.blobs.exists(&relative).await {
        return Err(RegistryError::not_found(format!("File not found: {file}")));
    }
    Ok(registry.blobs.absolute(&relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::reconciler::reconcile;
    use crate::services::testing::{fixture, source_build, staged_file, Fixture};

    fn acme() -> RepoId {
        RepoId::new("acme", "widget")
    }

    async fn upload(fx: &Fixture, name: &str, body: &[u8]) -> Vec<UploadedFile> {
        vec![staged_file(fx.registry.blobs.as_ref(), name, body).await]
    }

    fn staging_is_empty(fx: &Fixture) -> bool {
        std::fs::read_dir(fx.dir.path().join("uploads"))
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn ingest_creates_unknown_repository_with_secret() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");

        let files = upload(&fx, "app.bin", b"bits").await;
        ingest(&fx.registry, &acme(), "abc123", files).await.unwrap();

        let repo = fx.registry.store.get(&acme()).unwrap();
        assert!(repo.has_secret());
        assert_eq!(repo.link, "https://git.example/acme/widget");
        assert_eq!(repo.latest_non_empty_build.as_deref(), Some("abc123"));
        assert!(fx.dir.path().join("storage.json").exists());
        assert!(fx.dir.path().join("buildfiles/acme/widget/abc123/app.bin").exists());
        assert!(staging_is_empty(&fx));
    }

    #[tokio::test]
    async fn reconcile_after_ingest_keeps_artifact_path() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");

        let now = Utc::now();
        let files = upload(&fx, "app.bin", b"bits").await;
        ingest_at(&fx.registry, &acme(), "abc123", files, now).await.unwrap();
        let repo = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(repo.builds["abc123"].push_date, now);

        fx.source.set_builds(
            &acme(),
            vec![source_build("abc123", now.timestamp() - 30, "main")],
        );
        reconcile(&fx.registry, &acme()).await.unwrap();

        let repo = fx.registry.store.get(&acme()).unwrap();
        let build = &repo.builds["abc123"];
        assert_eq!(build.artifact_path.as_deref(), Some("acme/widget/abc123"));
        assert_eq!(build.last_artifact_change, Some(now));
        assert_eq!(build.branch, "main");
    }

    #[tokio::test]
    async fn ingest_for_repository_unknown_everywhere_is_not_found() {
        let fx = fixture("");
        let files = upload(&fx, "a", b"x").await;
        let err = ingest(&fx.registry, &acme(), "abc", files).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
        assert!(fx.registry.store.is_empty());
        assert!(staging_is_empty(&fx));
    }

    #[tokio::test]
    async fn path_segments_are_validated() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        for (commit, file) in [("..", "a"), ("abc", "../escape"), ("abc", ""), ("a/b", "f")] {
            let files = upload(&fx, file, b"x").await;
            let err = ingest(&fx.registry, &acme(), commit, files).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidInput(_)), "{commit} {file}");
        }
        assert!(staging_is_empty(&fx));
        let err = ingest(&fx.registry, &acme(), "abc", Vec::new()).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn latest_file_search_ignores_case() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        let blobs = fx.registry.blobs.as_ref();
        let files = vec![
            staged_file(blobs, "Widget-Linux.tar.gz", b"l").await,
            staged_file(blobs, "widget-windows.zip", b"w").await,
        ];
        ingest(&fx.registry, &acme(), "abc", files).await.unwrap();

        let (name, path) = find_latest_file(&fx.registry, &acme(), "WINDOWS").await.unwrap();
        assert_eq!(name, "widget-windows.zip");
        assert!(path.ends_with("acme/widget/abc/widget-windows.zip"));

        assert!(matches!(
            find_latest_file(&fx.registry, &acme(), "macos").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            find_latest_file(&fx.registry, &acme(), "").await,
            Err(RegistryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn resolve_file_requires_existing_file() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        let files = upload(&fx, "app.bin", b"bits").await;
        ingest(&fx.registry, &acme(), "abc", files).await.unwrap();

        let path = resolve_file(&fx.registry, &acme(), "abc", "app.bin").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"bits");
        assert!(matches!(
            resolve_file(&fx.registry, &acme(), "abc", "other.bin").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            resolve_file(&fx.registry, &acme(), "nope", "app.bin").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn segment_check() {
        assert!(check_segment("file", "app-1.0.tar.gz").is_ok());
        assert!(check_segment("file", "..").is_err());
        assert!(check_segment("file", "a\\b").is_err());
    }
}
