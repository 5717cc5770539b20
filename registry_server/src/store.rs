//! In-memory registry of repositories with whole-snapshot persistence.
//!
//! Reads return clones, so a caller always sees one consistent version of a
//! repository. Mutations of a repository happen under its async lock
//! (`lock`), and every durable change is followed by `snapshot`, which
//! rewrites the whole file through a temporary file and a rename.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

use crate::error::RegistryResult;
use crate::models::{RepoId, Repository};
use crate::services::credentials::SigningKeyProvider;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    repositories: BTreeMap<String, Repository>,
}

pub struct RegistryStore {
    path: PathBuf,
    repos: RwLock<BTreeMap<String, Repository>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    persist: tokio::sync::Mutex<()>,
}

impl RegistryStore {
    /// Empty store that snapshots to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            repos: RwLock::new(BTreeMap::new()),
            locks: Mutex::new(HashMap::new()),
            persist: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the last snapshot from `path`. A missing file is an empty registry.
    pub async fn restore(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let store = Self::new(path);
        let bytes = match tokio::fs::read(&store.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %store.path.display(),
                    "No registry snapshot yet, starting empty"
                );
                return Ok(store);
            }
            Err(e) => return Err(anyhow::anyhow!("reading {}: {e}", store.path.display())),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("decoding {}: {e}", store.path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                store.path.display()
            );
        }
        tracing::info!(
            repositories = snapshot.repositories.len(),
            "Restored registry snapshot"
        );
        *store.write() = snapshot.repositories;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Repository>> {
        self.repos.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Repository>> {
        self.repos.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &RepoId) -> Option<Repository> {
        self.read().get(&id.key()).cloned()
    }

    pub fn contains(&self, id: &RepoId) -> bool {
        self.read().contains_key(&id.key())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn ids(&self) -> Vec<RepoId> {
        self.read().values().map(Repository::id).collect()
    }

    pub fn list(&self) -> Vec<Repository> {
        self.read().values().cloned().collect()
    }

    /// Insert or replace a repository.
    pub fn upsert(&self, repo: Repository) {
        let key = repo.id().key();
        self.write().insert(key, repo);
    }

    /// Insert only if no repository with the same id exists.
    pub fn insert_if_absent(&self, repo: Repository) -> bool {
        let key = repo.id().key();
        let mut repos = self.write();
        if repos.contains_key(&key) {
            return false;
        }
        repos.insert(key, repo);
        true
    }

    /// Exclusive access to one repository for a read-modify-write cycle.
    pub async fn lock(&self, id: &RepoId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.key())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Write the whole registry to disk.
    pub async fn snapshot(&self) -> RegistryResult<()> {
        let _guard = self.persist.lock().await;
        let bytes = {
            let repos = self.read();
            serde_json::to_vec(&SnapshotRef {
                version: SNAPSHOT_VERSION,
                repositories: &repos,
            })?
        };

        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;

        crate::metrics::repositories(self.len());
        tracing::debug!(
            path = %self.path.display(),
            bytes = bytes.len(),
            "Registry snapshot written"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    repositories: &'a BTreeMap<String, Repository>,
}

impl SigningKeyProvider for RegistryStore {
    fn signing_key(&self, repo: &RepoId) -> Option<String> {
        self.read()
            .get(&repo.key())
            .and_then(|r| r.secret.clone())
            .filter(|s| !s.is_empty())
    }
}
