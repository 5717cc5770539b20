//! Drone integration — the authoritative source of repositories and builds.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// A repository as the CI engine reports it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceRepository {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub active: bool,
}

/// A build record as the CI engine reports it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceBuild {
    #[serde(rename = "id")]
    pub external_id: i64,
    #[serde(default)]
    pub title: String,
    /// Unix seconds of the last update.
    #[serde(rename = "updated", default)]
    pub updated_unix: i64,
    #[serde(default)]
    pub link: String,
    #[serde(rename = "target", default)]
    pub target_branch: String,
    #[serde(rename = "source", default)]
    pub source_branch: String,
    #[serde(rename = "after", default)]
    pub commit_hash: String,
}

#[async_trait]
pub trait CiSource: Send + Sync {
    /// Every active repository visible to the configured account.
    async fn list_active_repositories(&self) -> anyhow::Result<Vec<SourceRepository>>;

    /// A single repository, looked up directly.
    async fn repository(&self, namespace: &str, name: &str) -> anyhow::Result<SourceRepository>;

    /// The newest `page_size` builds of a repository.
    async fn list_builds(
        &self,
        namespace: &str,
        name: &str,
        page_size: usize,
    ) -> anyhow::Result<Vec<SourceBuild>>;
}

/// HTTP client for the Drone REST API.
#[derive(Debug, Clone)]
pub struct DroneClient {
    host: String,
    token: String,
    http: reqwest::Client,
}

impl DroneClient {
    pub fn new(host: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("drydock/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{path}", self.host);
        let resp = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(%url, %status, "Drone request failed");
            anyhow::bail!("GET {path} returned {status}: {}", text.trim());
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl CiSource for DroneClient {
    async fn list_active_repositories(&self) -> anyhow::Result<Vec<SourceRepository>> {
        let repos: Vec<SourceRepository> = self.get("/api/user/repos").await?;
        Ok(repos.into_iter().filter(|r| r.active).collect())
    }

    async fn repository(&self, namespace: &str, name: &str) -> anyhow::Result<SourceRepository> {
        self.get(&format!("/api/repos/{namespace}/{name}")).await
    }

    async fn list_builds(
        &self,
        namespace: &str,
        name: &str,
        page_size: usize,
    ) -> anyhow::Result<Vec<SourceBuild>> {
        self.get(&format!(
            "/api/repos/{namespace}/{name}/builds?page=1&per_page={page_size}"
        ))
        .await
    }
}
