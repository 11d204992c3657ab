mod env;

pub use env::apply_env_overrides;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Complete broker configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub xero: ProviderSettings,
    #[serde(default)]
    pub quickbooks: ProviderSettings,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Browser origin allowed by CORS (the UI dev server)
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// Serve the debug token routes
    #[serde(default = "default_true")]
    pub expose_tokens: bool,
}

fn default_port() -> u16 {
    3000
}

fn default_cors_origin() -> String {
    "http://localhost:5173".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_origin: default_cors_origin(),
            expose_tokens: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Json,
    Sqlite,
}

/// Token persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory holding token files or the SQLite database
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            directory: default_directory(),
        }
    }
}

/// Authorization flow and token lifecycle tuning
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// How long a CSRF state stays valid
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
    /// Issuing a state invalidates earlier in-flight states for the same
    /// provider (one authorization in flight per provider)
    #[serde(default = "default_true")]
    pub exclusive_per_provider: bool,
    /// Refresh this long before the access token expires
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_seconds: i64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

fn default_refresh_skew() -> i64 {
    300
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
            exclusive_per_provider: true,
            refresh_skew_seconds: default_refresh_skew(),
        }
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Timeout applied to every upstream request
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
        }
    }
}

/// QuickBooks API environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

/// Per-provider credentials and endpoint overrides.
///
/// Unset endpoints fall back to the provider's public URLs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    pub scopes: Option<Vec<String>>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub revoke_url: Option<String>,
    pub enrichment_url: Option<String>,
    pub api_base_url: Option<String>,
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BrokerConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: BrokerConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
