//! Application configuration

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{AuthConfig, FlowTimeouts, FreshnessPolicy};

const DEFAULT_API_BASE: &str = "https://api.schwabapi.com";
const DEFAULT_AUTHORIZE_URL: &str = "https://api.schwabapi.com/v1/oauth/authorize";
const DEFAULT_TOKEN_URL: &str = "https://api.schwabapi.com/v1/oauth/token";
const DEFAULT_REDIRECT_URI: &str = "https://127.0.0.1:8182/callback";

/// Session timing knobs. The defaults assume a 30-minute access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Stop reusing a token this many seconds before it expires
    pub safety_margin_secs: u64,
    /// Reuse window for tokens issued without `expires_in`
    pub fallback_window_secs: u64,
    /// How long to wait for the browser callback
    pub callback_timeout_secs: u64,
    /// How long the callback listener may take to become reachable
    pub listener_startup_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let freshness = FreshnessPolicy::default();
        let timeouts = FlowTimeouts::default();
        Self {
            safety_margin_secs: freshness.safety_margin_secs,
            fallback_window_secs: freshness.fallback_window_secs,
            callback_timeout_secs: timeouts.callback.as_secs(),
            listener_startup_timeout_secs: timeouts.listener_startup.as_secs(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OAuth client identifier (app key)
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Registered redirect URL; the callback listener binds its host and port
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    /// Base URL for market-data and trader endpoints
    pub api_base: String,
    /// Optional OAuth scope sent with the authorization request
    pub scope: Option<String>,
    /// PEM certificate for an https redirect_uri
    pub tls_cert_path: Option<PathBuf>,
    /// PKCS#8 PEM private key matching `tls_cert_path`
    pub tls_key_path: Option<PathBuf>,
    /// Override for where the credential record is kept
    pub credential_path: Option<PathBuf>,
    pub session: SessionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            scope: None,
            tls_cert_path: None,
            tls_key_path: None,
            credential_path: None,
            session: SessionSettings::default(),
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "trader-cli", "trader-cli")
            .context("Could not determine config directory")
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load configuration from `path`, or the default location.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains the client secret)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Where the session credential is persisted.
    pub fn credential_path(&self) -> Result<PathBuf> {
        match &self.credential_path {
            Some(p) => Ok(p.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("credential.json")),
        }
    }

    /// Check the fields needed to talk to the brokerage.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            bail!("client_id is not set. Run 'trader-cli init' and edit the config file.");
        }
        if self.client_secret.trim().is_empty() {
            bail!("client_secret is not set. Run 'trader-cli init' and edit the config file.");
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            bail!("tls_cert_path and tls_key_path must be set together");
        }
        Ok(())
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            authorize_url: self.authorize_url.clone(),
            token_url: self.token_url.clone(),
            scope: self.scope.clone(),
        }
    }

    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            safety_margin_secs: self.session.safety_margin_secs,
            fallback_window_secs: self.session.fallback_window_secs,
        }
    }

    pub fn flow_timeouts(&self) -> FlowTimeouts {
        FlowTimeouts {
            listener_startup: Duration::from_secs(self.session.listener_startup_timeout_secs),
            callback: Duration::from_secs(self.session.callback_timeout_secs),
        }
    }
}
