//! A CI repository mirrored into the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::build::Build;

/// `(namespace, name)` pair identifying one repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub namespace: String,
    pub name: String,
}

impl RepoId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Store key, `"namespace/name"`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub namespace: String,
    pub name: String,
    pub link: String,
    /// Per-repository signing key. `None` until a key is first requested
    /// or the repository is created by an upload.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub branches: BTreeSet<String>,
    /// Builds keyed by commit hash.
    #[serde(default)]
    pub builds: BTreeMap<String, Build>,
    #[serde(default)]
    pub latest_build: Option<String>,
    #[serde(default)]
    pub latest_non_empty_build: Option<String>,
}

impl Repository {
    pub fn new(id: &RepoId, link: impl Into<String>) -> Self {
        Self {
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            link: link.into(),
            secret: None,
            branches: BTreeSet::new(),
            builds: BTreeMap::new(),
            latest_build: None,
            latest_non_empty_build: None,
        }
    }

    pub fn id(&self) -> RepoId {
        RepoId::new(&self.namespace, &self.name)
    }

    pub fn has_secret(&self) -> bool {
        self.secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// The build with the newest push date, if any.
    pub fn latest(&self) -> Option<(&String, &Build)> {
        self.latest_build
            .as_ref()
            .and_then(|commit| self.builds.get_key_value(commit))
    }

    /// The newest build that still has artifacts on disk.
    pub fn latest_non_empty(&self) -> Option<(&String, &Build)> {
        self.latest_non_empty_build
            .as_ref()
            .and_then(|commit| self.builds.get_key_value(commit))
    }
}
