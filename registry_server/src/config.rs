//! Registry configuration — a TOML file plus environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::services::credentials::DEFAULT_REPOSITORY_REFRESH_DAYS;
use crate::services::listing::BUILDS_PER_PAGE;
use crate::storage::create_private_dir;

const TEMPLATE: &str = r#"# drydock configuration

# Drone server and an access token for an account that sees every repository.
drone_host = "https://drone.example.com"
drone_token = ""

# Lifetime of repository refresh tokens, in days.
token_period_days = 40

# Admin login. Generate the hash with `drydock password`.
username = "admin"
password_hash = ""

# Delete artifacts not changed for this long, e.g. "1y30d2h" or "90d".
# Empty disables retention.
max_age = ""

sweep_interval_secs = 300
upstream_timeout_secs = 30
max_upload_mb = 1024
builds_per_page = 6
"#;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the Drone server.
    pub drone_host: String,
    /// Drone API token.
    pub drone_token: String,
    /// Refresh period for repository tokens.
    pub token_period_days: i64,
    /// Admin username.
    pub username: String,
    /// Argon2 PHC hash of the admin password.
    pub password_hash: String,
    /// Retention policy, e.g. `30d`.
    pub max_age: String,
    /// Seconds between background sweeps.
    pub sweep_interval_secs: u64,
    /// Timeout for each CI source request.
    pub upstream_timeout_secs: u64,
    /// Upload body limit in megabytes.
    pub max_upload_mb: usize,
    pub builds_per_page: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            drone_host: String::new(),
            drone_token: String::new(),
            token_period_days: DEFAULT_REPOSITORY_REFRESH_DAYS,
            username: "admin".to_string(),
            password_hash: String::new(),
            max_age: String::new(),
            sweep_interval_secs: 300,
            upstream_timeout_secs: 30,
            max_upload_mb: 1024,
            builds_per_page: BUILDS_PER_PAGE,
        }
    }
}

impl RegistryConfig {
    /// Load the config file, writing a template and failing if it is missing.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_template(path).await?;
                anyhow::bail!(
                    "no config found, a template was written to {}; fill it in and restart",
                    path.display()
                );
            }
            Err(e) => anyhow::bail!("reading {}: {e}", path.display()),
        };
        let mut config = Self::from_toml(&text)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.warn_incomplete();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `DRYDOCK_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("DRYDOCK_DRONE_HOST") {
            self.drone_host = host;
        }
        if let Some(token) = lookup("DRYDOCK_DRONE_TOKEN") {
            self.drone_token = token;
        }
        if let Some(max_age) = lookup("DRYDOCK_MAX_AGE") {
            self.max_age = max_age;
        }
    }

    fn warn_incomplete(&self) {
        if self.drone_token.is_empty() {
            tracing::warn!("drone_token not set -- CI source requests will be anonymous");
        }
        if self.password_hash.is_empty() {
            tracing::warn!("password_hash not set -- admin password login disabled");
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }

    /// Time bound for reconciling one repository during a sweep.
    pub fn sweep_repository_timeout(&self) -> Duration {
        self.upstream_timeout() * 2
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

async fn write_template(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent)
            .await
            .map_err(|e| anyhow::anyhow!("creating {}: {e}", parent.display()))?;
    }
    tokio::fs::write(path, TEMPLATE)
        .await
        .map_err(|e| anyhow::anyhow!("writing {}: {e}", path.display()))?;
    Ok(())
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drydock")
        .join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drydock")
}
