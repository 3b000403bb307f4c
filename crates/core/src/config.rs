use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides `github.token`.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub repeater: RepeaterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Applied to connect, read and write on every outbound call.
    #[serde(default = "default_github_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of times the conclusion of a found run is checked before giving up.
    /// `1` fails as soon as the run is seen in progress.
    #[serde(default = "default_conclusion_attempts")]
    pub conclusion_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepeaterConfig {
    #[serde(default = "default_allowed_endpoints")]
    pub allowed_endpoints: Vec<String>,
}

fn default_request_timeout_secs() -> u64 { 60 }

fn default_api_url() -> String { "https://api.github.com".to_string() }

fn default_github_timeout_secs() -> u64 { 10 }

fn default_max_poll_attempts() -> u32 { 10 }

fn default_poll_interval_ms() -> u64 { 250 }

fn default_conclusion_attempts() -> u32 { 1 }

fn default_allowed_endpoints() -> Vec<String> {
    vec!["/api/endpoint1".to_string(), "/api/endpoint2".to_string()]
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_poll_attempts: default_max_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            conclusion_attempts: default_conclusion_attempts(),
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
}

impl Default for RepeaterConfig {
    fn default() -> Self { Self { allowed_endpoints: default_allowed_endpoints() } }
}

impl GitHubConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

impl Config {
    /// Load the YAML config at `path`, applying the `GITHUB_TOKEN` override.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = BufReader::new(
            File::open(path)
                .with_context(|| format!("Failed to open config file {}", path.display()))?,
        );
        let config = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Self::finish(config, std::env::var(GITHUB_TOKEN_ENV).ok())
    }

    fn finish(mut config: Self, token_override: Option<String>) -> Result<Self> {
        if let Some(token) = token_override.filter(|t| !t.is_empty()) {
            config.github.token = token;
        }
        if config.github.token.is_empty() {
            bail!("No GitHub token configured (set github.token or {GITHUB_TOKEN_ENV})");
        }
        if config.dispatch.max_poll_attempts == 0 {
            bail!("dispatch.max_poll_attempts must be at least 1");
        }
        if config.dispatch.conclusion_attempts == 0 {
            bail!("dispatch.conclusion_attempts must be at least 1");
        }
        Ok(config)
    }
}
