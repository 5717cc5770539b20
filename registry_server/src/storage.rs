//! Artifact blob store — a directory tree of `namespace/name/commit/file`.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// Permissions for every directory the registry creates.
#[cfg(unix)]
pub const DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create a directory and its parents. Existing directories are fine.
    async fn create_dir(&self, relative: &str) -> io::Result<()>;

    /// Open a fresh staging file for one streamed upload.
    async fn stage(&self) -> io::Result<StagedBlob>;

    /// Move a finished staging file to `relative`, replacing any file there.
    async fn commit_staged(&self, staged: &str, relative: &str) -> io::Result<()>;

    /// Remove a staging file that will not be committed. Already gone is fine.
    async fn discard_staged(&self, staged: &str) -> io::Result<()>;

    /// Regular files directly inside a directory, sorted by name.
    async fn list_dir(&self, relative: &str) -> io::Result<Vec<BlobEntry>>;

    async fn delete_subtree(&self, relative: &str) -> io::Result<()>;

    async fn exists(&self, relative: &str) -> bool;

    /// Absolute filesystem path, for serving files.
    fn absolute(&self, relative: &str) -> PathBuf;
}

/// Join path segments into a blob-store relative path.
pub fn blob_path(segments: &[&str]) -> String {
    segments.join("/")
}

/// An upload being written to a staging file, one chunk at a time.
#[derive(Debug)]
pub struct StagedBlob {
    name: String,
    file: tokio::fs::File,
    size: u64,
}

impl StagedBlob {
    pub fn new(name: String, file: tokio::fs::File) -> Self {
        Self { name, file, size: 0 }
    }

    /// Staging name, for `commit_staged` and `discard_staged`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Flush to disk. Returns the staging name and the byte count.
    pub async fn finish(mut self) -> io::Result<(String, u64)> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok((self.name, self.size))
    }
}

/// Local filesystem blob store. Uploads are staged in a sibling directory
/// on the same filesystem so committing them is a rename.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    staging: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging: staging.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the blob root and an empty staging directory. Staging files
    /// left by an interrupted upload are removed.
    pub async fn prepare(&self) -> io::Result<()> {
        create_private_dir(&self.root).await?;
        match tokio::fs::remove_dir_all(&self.staging).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        create_private_dir(&self.staging).await
    }

    fn staging_path(&self, staged: &str) -> io::Result<PathBuf> {
        if staged.is_empty() || staged.contains(['/', '\\']) || staged.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid staging name {staged:?}"),
            ));
        }
        Ok(self.staging.join(staged))
    }
}

/// `create_dir_all` with the registry's directory permissions.
pub async fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(path).await
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn create_dir(&self, relative: &str) -> io::Result<()> {
        create_private_dir(&self.absolute(relative)).await
    }

    async fn stage(&self) -> io::Result<StagedBlob> {
        create_private_dir(&self.staging).await?;
        let name = hex::encode(rand::random::<[u8; 16]>());
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.staging.join(&name))
            .await?;
        Ok(StagedBlob::new(name, file))
    }

    async fn commit_staged(&self, staged: &str, relative: &str) -> io::Result<()> {
        tokio::fs::rename(self.staging_path(staged)?, self.absolute(relative)).await
    }

    async fn discard_staged(&self, staged: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.staging_path(staged)?).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    async fn list_dir(&self, relative: &str) -> io::Result<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.absolute(relative)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            entries.push(BlobEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete_subtree(&self, relative: &str) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.absolute(relative)).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    async fn exists(&self, relative: &str) -> bool {
        tokio::fs::try_exists(self.absolute(relative))
            .await
            .unwrap_or(false)
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

/// Human-readable size with a 1000 base, e.g. `999B`, `1.5K`, `2.0M`.
pub fn human_size(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes}B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1}{}", bytes as f64 / div as f64, suffix)
}
