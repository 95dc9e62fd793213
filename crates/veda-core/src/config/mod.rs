use crate::error::{Result, VedaError};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides `backend.base_url` after all files are merged.
pub const BACKEND_URL_ENV: &str = "VEDA_BACKEND_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VedaConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Connect timeout, and the whole-request timeout of the login and
    /// read calls. Streamed replies are not bounded by it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for the idempotent reads (history, session list).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub token: Option<String>,
    /// Env var consulted when `token` is unset. Defaults to `VEDA_TOKEN`.
    #[serde(default)]
    pub env_var: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Keep reading (and discarding) the reply stream after `[DONE]` until
    /// the server closes it. When false the connection is dropped at once.
    #[serde(default = "default_true")]
    pub drain_after_done: bool,
    #[serde(default = "default_true")]
    pub refresh_sessions_on_send: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            drain_after_done: true,
            refresh_sessions_on_send: true,
        }
    }
}

// -- Defaults --

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> usize {
    2
}
fn default_retry_base_delay_ms() -> u64 {
    250
}
fn default_true() -> bool {
    true
}

const DEFAULT_TOKEN_ENV: &str = "VEDA_TOKEN";

impl VedaConfig {
    /// Load configuration with three-layer TOML merge:
    /// 1. ~/.config/veda/config.toml (global)
    /// 2. .veda/config.toml (project)
    /// 3. .veda/config.local.toml (local, gitignored)
    ///
    /// `VEDA_BACKEND_URL` wins over all three.
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        // Layer 1: Global config
        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                builder = builder.add_source(File::from(global_path).required(false));
            }
        }

        // Layer 2: Project config
        if let Some(dir) = project_dir {
            let project_config = dir.join(".veda").join("config.toml");
            if project_config.exists() {
                builder = builder.add_source(File::from(project_config).required(false));
            }

            // Layer 3: Local config (gitignored)
            let local_config = dir.join(".veda").join("config.local.toml");
            if local_config.exists() {
                builder = builder.add_source(File::from(local_config).required(false));
            }
        }

        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            if !url.trim().is_empty() {
                builder = builder
                    .set_override("backend.base_url", url)
                    .map_err(|e| VedaError::Config(e.to_string()))?;
            }
        }

        let config = builder
            .build()
            .map_err(|e| VedaError::Config(e.to_string()))?;

        let mut cfg: Self = config
            .try_deserialize()
            .map_err(|e| VedaError::Config(e.to_string()))?;

        cfg.validate();
        Ok(cfg)
    }

    /// Load with defaults only (no files).
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Validate config values, fixing out-of-range values and logging warnings.
    /// Lenient: the config is repaired, never rejected.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        let url = self.backend.base_url.trim();
        if url.is_empty() {
            warnings.push(format!(
                "backend.base_url is empty, using {}",
                default_base_url()
            ));
            self.backend.base_url = default_base_url();
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            warnings.push(format!(
                "backend.base_url '{url}' has no http(s) scheme, assuming http://"
            ));
            self.backend.base_url = format!("http://{url}");
        }

        if self.backend.timeout_secs == 0 {
            warnings.push("backend.timeout_secs = 0, setting to 1".to_string());
            self.backend.timeout_secs = 1;
        }

        if self.backend.max_retries > 10 {
            warnings.push(format!(
                "backend.max_retries = {} is excessive, clamping to 10",
                self.backend.max_retries
            ));
            self.backend.max_retries = 10;
        }

        for w in &warnings {
            tracing::warn!("config: {}", w);
        }

        warnings
    }
}

/// Resolve the bearer token from config or the configured env var.
/// Returns `None` when neither is set; requests then go out unauthenticated.
pub fn resolve_token(config: &AuthConfig) -> Option<String> {
    if let Some(ref token) = config.token {
        if !token.is_empty() {
            return Some(token.clone());
        }
    }

    let env_var_name = config.env_var.as_deref().unwrap_or(DEFAULT_TOKEN_ENV);
    std::env::var(env_var_name)
        .ok()
        .filter(|token| !token.trim().is_empty())
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("veda").join("config.toml"))
}
