//! In-crate fakes for the CI source and blob store.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::models::RepoId;
use crate::registry::Registry;
use crate::services::drone_service::{CiSource, SourceBuild, SourceRepository};
use crate::services::retention::MaxAge;
use crate::services::artifact_service::UploadedFile;
use crate::storage::{BlobEntry, BlobStore, FsBlobStore, StagedBlob};
use crate::store::RegistryStore;

#[derive(Default)]
pub struct FakeSource {
    repos: Mutex<Vec<SourceRepository>>,
    builds: Mutex<HashMap<String, Vec<SourceBuild>>>,
    down: Mutex<bool>,
    failing: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
}

impl FakeSource {
    pub fn add_repo(&self, namespace: &str, name: &str) {
        self.repos.lock().unwrap().push(SourceRepository {
            namespace: namespace.into(),
            name: name.into(),
            link: format!("https://git.example/{namespace}/{name}"),
            active: true,
        });
    }

    pub fn set_builds(&self, id: &RepoId, builds: Vec<SourceBuild>) {
        self.builds.lock().unwrap().insert(id.key(), builds);
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    /// Build listings for `id` fail.
    pub fn fail_repo(&self, id: &RepoId) {
        self.failing.lock().unwrap().insert(id.key());
    }

    /// Build listings for `id` never complete.
    pub fn stall_repo(&self, id: &RepoId) {
        self.stalled.lock().unwrap().insert(id.key());
    }

    fn check_up(&self) -> anyhow::Result<()> {
        if *self.down.lock().unwrap() {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl CiSource for FakeSource {
    async fn list_active_repositories(&self) -> anyhow::Result<Vec<SourceRepository>> {
        self.check_up()?;
        Ok(self.repos.lock().unwrap().clone())
    }

    async fn repository(&self, namespace: &str, name: &str) -> anyhow::Result<SourceRepository> {
        self.check_up()?;
        self.repos
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.namespace == namespace && r.name == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404 Not Found"))
    }

    async fn list_builds(
        &self,
        namespace: &str,
        name: &str,
        page_size: usize,
    ) -> anyhow::Result<Vec<SourceBuild>> {
        self.check_up()?;
        let key = RepoId::new(namespace, name).key();
        if self.failing.lock().unwrap().contains(&key) {
            anyhow::bail!("500 Internal Server Error");
        }
        let stalled = self.stalled.lock().unwrap().contains(&key);
        if stalled {
            std::future::pending::<()>().await;
        }
        let builds = self.builds.lock().unwrap().get(&key).cloned().unwrap_or_default();
        Ok(builds.into_iter().take(page_size).collect())
    }
}

pub fn source_build(commit: &str, updated_unix: i64, branch: &str) -> SourceBuild {
    SourceBuild {
        external_id: updated_unix % 1000,
        title: format!("Commit {commit}\n\nbody"),
        updated_unix,
        link: format!("https://git.example/commit/{commit}"),
        target_branch: branch.into(),
        source_branch: "feature".into(),
        commit_hash: commit.into(),
    }
}

/// Filesystem blob store whose deletes can be made to fail.
pub struct FlakyBlobs {
    inner: FsBlobStore,
    fail_deletes: Mutex<bool>,
}

impl FlakyBlobs {
    pub fn new(root: &Path, staging: &Path) -> Self {
        Self {
            inner: FsBlobStore::new(root, staging),
            fail_deletes: Mutex::new(false),
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        *self.fail_deletes.lock().unwrap() = fail;
    }
}

#[async_trait]
impl BlobStore for FlakyBlobs {
    async fn create_dir(&self, relative: &str) -> io::Result<()> {
        self.inner.create_dir(relative).await
    }

    async fn stage(&self) -> io::Result<StagedBlob> {
        self.inner.stage().await
    }

    async fn commit_staged(&self, staged: &str, relative: &str) -> io::Result<()> {
        self.inner.commit_staged(staged, relative).await
    }

    async fn discard_staged(&self, staged: &str) -> io::Result<()> {
        self.inner.discard_staged(staged).await
    }

    async fn list_dir(&self, relative: &str) -> io::Result<Vec<BlobEntry>> {
        self.inner.list_dir(relative).await
    }

    async fn delete_subtree(&self, relative: &str) -> io::Result<()> {
        if *self.fail_deletes.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
        }
        self.inner.delete_subtree(relative).await
    }

    async fn exists(&self, relative: &str) -> bool {
        self.inner.exists(relative).await
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.inner.absolute(relative)
    }
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub source: Arc<FakeSource>,
    pub blobs: Arc<FlakyBlobs>,
    pub registry: Registry,
}

pub fn fixture(max_age: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::default());
    let blobs = Arc::new(FlakyBlobs::new(
        &dir.path().join("buildfiles"),
        &dir.path().join("uploads"),
    ));
    let store = Arc::new(RegistryStore::new(dir.path().join("storage.json")));
    let registry = Registry::new(store, blobs.clone(), source.clone(), MaxAge::parse(max_age));
    Fixture {
        dir,
        source,
        blobs,
        registry,
    }
}

/// Stage `contents` as an upload named `name`.
pub async fn staged_file(blobs: &dyn BlobStore, name: &str, contents: &[u8]) -> UploadedFile {
    let mut blob = blobs.stage().await.unwrap();
    blob.write_chunk(contents).await.unwrap();
    let (staged, size) = blob.finish().await.unwrap();
    UploadedFile {
        name: name.into(),
        staged,
        size,
    }
}

/// Write a file straight into the blob store.
pub async fn put_file(blobs: &dyn BlobStore, relative: &str, contents: &[u8]) {
    let file = staged_file(blobs, "", contents).await;
    blobs.commit_staged(&file.staged, relative).await.unwrap();
}
