//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The token list is loaded from the TOKEN_LIST env var or `pool.tokens_file`,
//! never stored in the TOML directly to avoid leaking secrets. The inbound API
//! key comes from VALID_API_KEY or `proxy.api_key` and is required.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Env var holding the comma-separated token list.
pub const TOKEN_LIST_ENV: &str = "TOKEN_LIST";

/// Env var holding the key inbound callers must present.
pub const API_KEY_ENV: &str = "VALID_API_KEY";

/// Env var overriding `pool.max_failures`.
pub const MAX_FAILURES_ENV: &str = "MAX_TOKEN_FAILURES";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Inbound listener and upstream settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bearer key callers must present; overridden by VALID_API_KEY
    #[serde(default)]
    pub api_key: Option<Secret<String>>,
}

/// Admin API listener, kept off the proxy port
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_admin_addr(),
        }
    }
}

/// Token pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// File containing the token list (alternative to the TOKEN_LIST env var)
    #[serde(default)]
    pub tokens_file: Option<PathBuf>,
    #[serde(skip)]
    pub tokens: Option<Secret<String>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            tokens_file: None,
            tokens: None,
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    100
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_failures() -> u32 {
    token_pool::DEFAULT_MAX_FAILURES
}

/// Where the token list comes from. Re-read on admin reload.
#[derive(Debug, Clone, Default)]
pub struct TokenSource {
    tokens_file: Option<PathBuf>,
}

impl TokenSource {
    pub fn new(tokens_file: Option<PathBuf>) -> Self {
        Self { tokens_file }
    }

    /// Read the current token list.
    ///
    /// Resolution order:
    /// 1. TOKEN_LIST env var (if not blank)
    /// 2. tokens_file contents (if not blank)
    ///
    /// Returns `Ok(None)` when neither yields anything; an unreadable
    /// tokens_file is an error.
    pub fn resolve(&self) -> common::Result<Option<Secret<String>>> {
        if let Ok(list) = std::env::var(TOKEN_LIST_ENV)
            && !list.trim().is_empty()
        {
            return Ok(Some(Secret::new(list)));
        }

        let Some(ref path) = self.tokens_file else {
            return Ok(None);
        };
        let contents = std::fs::read_to_string(path).map_err(|e| {
            common::Error::Config(format!(
                "failed to read tokens_file {}: {e}",
                path.display()
            ))
        })?;
        let contents = contents.trim();
        if contents.is_empty() {
            return Ok(None);
        }
        Ok(Some(Secret::from(contents)))
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if let Ok(raw) = std::env::var(MAX_FAILURES_ENV) {
            config.pool.max_failures = raw.trim().parse().map_err(|e| {
                common::Error::Config(format!("{MAX_FAILURES_ENV} must be an integer, got {raw:?}: {e}"))
            })?;
        }

        if let Ok(key) = std::env::var(API_KEY_ENV)
            && !key.trim().is_empty()
        {
            config.proxy.api_key = Some(Secret::new(key.trim().to_owned()));
        }
        if config
            .proxy
            .api_key
            .as_ref()
            .is_none_or(|k| k.expose().trim().is_empty())
        {
            return Err(common::Error::Config(format!(
                "no API key configured: set {API_KEY_ENV} or proxy.api_key"
            )));
        }

        if config.pool.max_failures == 0 {
            return Err(common::Error::Config(
                "max_failures must be greater than 0".into(),
            ));
        }

        config.pool.tokens = config.token_source().resolve()?;
        if config.pool.tokens.is_none() {
            return Err(common::Error::Config(format!(
                "no tokens configured: set {TOKEN_LIST_ENV} or pool.tokens_file"
            )));
        }

        Ok(config)
    }

    pub fn token_source(&self) -> TokenSource {
        TokenSource::new(self.pool.tokens_file.clone())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-proxy.toml")
    }
}
