//! Deployment configuration.
//!
//! A `DeploymentConfig` is immutable after construction and identifies one
//! inference endpoint: addressing, credential, request timeout, and the
//! rate limits the balancer accounts against. Configurations can be built
//! programmatically or loaded from a JSON file.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
#[builder(derive(Clone))]
pub struct DeploymentConfig {
    /// Unique identifier; the primary key within a switchboard.
    pub name: String,
    pub api_base: Url,
    pub api_key: String,
    #[serde(default = "default_api_version")]
    #[builder(default = default_api_version())]
    pub api_version: String,
    /// Per-request wall-clock bound, in seconds.
    #[serde(default = "default_timeout_secs")]
    #[builder(default = default_timeout_secs())]
    pub timeout_secs: u64,
    /// Tokens-per-window limit; 0 means unlimited.
    #[serde(default)]
    #[builder(default)]
    pub tpm_ratelimit: u64,
    /// Requests-per-window limit; 0 means unlimited.
    #[serde(default)]
    #[builder(default)]
    pub rpm_ratelimit: u64,
    /// Minimum spacing between health probes of this deployment, in
    /// seconds.
    #[serde(default = "default_healthcheck_interval_secs")]
    #[builder(default = default_healthcheck_interval_secs())]
    pub healthcheck_interval_secs: u64,
    /// How long the deployment sits out after a failure, in seconds.
    #[serde(default = "default_cooldown_period_secs")]
    #[builder(default = default_cooldown_period_secs())]
    pub cooldown_period_secs: u64,
}

fn default_api_version() -> String {
    "2024-10-21".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_healthcheck_interval_secs() -> u64 {
    30
}

fn default_cooldown_period_secs() -> u64 {
    60
}

impl DeploymentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn healthcheck_interval(&self) -> Duration {
        Duration::from_secs(self.healthcheck_interval_secs)
    }

    pub fn cooldown_period(&self) -> Duration {
        Duration::from_secs(self.cooldown_period_secs)
    }
}

/// Normalizes a URL to ensure it has a trailing slash.
///
/// This matters for path joining: `Url::join` treats a URL without a
/// trailing slash as having a "file" component that gets replaced, so
/// `https://host/openai` + `chat/completions` would lose the `/openai`
/// segment.
pub(crate) fn normalize_url(mut url: Url) -> Url {
    let path = url.path();
    if !path.ends_with('/') {
        url.set_path(&format!("{path}/"));
    }
    url
}

/// The config file holds the deployment pool for one switchboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub deployments: Vec<DeploymentConfig>,
}

impl ConfigFile {
    pub async fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path.display(), e))?;

        let config: ConfigFile = serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path.display(), e))?;

        info!(
            "Loaded {} deployment(s) from {}",
            config.deployments.len(),
            path.display()
        );
        Ok(config)
    }
}
