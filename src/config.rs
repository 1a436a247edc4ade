//! Configuration management

use std::{collections::BTreeMap, env, net::SocketAddr, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::oauth::ClientAuthMethod;
use crate::{Error, Result};

/// Prefix for environment variable overrides (`OAUTH_M2M_HTTP__TIMEOUT=5s`)
pub const ENV_PREFIX: &str = "OAUTH_M2M_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Authorization server (issuer) settings
    pub issuer: IssuerConfig,
    /// Client registrations keyed by registration id
    pub clients: BTreeMap<String, ClientConfig>,
    /// Registration used when the CLI is not told which one to use
    pub default_client: Option<String>,
    /// Principal name the outbound calls are made on behalf of
    pub principal: String,
    /// Downstream service called with the acquired token
    pub downstream: DownstreamConfig,
    /// Outbound HTTP client settings
    pub http: HttpConfig,
    /// Token cache settings
    pub cache: CacheConfig,
    /// Protected resource server settings
    pub resource: ResourceConfig,
    /// Retry settings for token acquisition
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            issuer: IssuerConfig::default(),
            clients: BTreeMap::new(),
            default_client: None,
            principal: "machine".to_string(),
            downstream: DownstreamConfig::default(),
            http: HttpConfig::default(),
            cache: CacheConfig::default(),
            resource: ResourceConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed,
    /// or if a secret reference cannot be resolved.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before expansion so their variables resolve
        config.load_env_files();
        config.expand_env_vars()?;
        config.resolve_secrets()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in URLs and credentials
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.issuer.base_url = Self::expand_string(&re, &self.issuer.base_url);
        if let Some(jwks_uri) = &mut self.issuer.jwks_uri {
            *jwks_uri = Self::expand_string(&re, jwks_uri);
        }
        self.downstream.base_url = Self::expand_string(&re, &self.downstream.base_url);

        for client in self.clients.values_mut() {
            client.client_id = Self::expand_string(&re, &client.client_id);
            client.client_secret = Self::expand_string(&re, &client.client_secret);
            if let Some(endpoint) = &mut client.token_endpoint {
                *endpoint = Self::expand_string(&re, endpoint);
            }
        }

        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Replace `env:NAME` client secrets with the value of `NAME`
    fn resolve_secrets(&mut self) -> Result<()> {
        for (id, client) in &mut self.clients {
            if let Some(var_name) = client.client_secret.strip_prefix("env:") {
                let var_name = var_name.to_string();
                client.client_secret = env::var(&var_name).map_err(|_| {
                    Error::Config(format!(
                        "Client '{id}' references secret env var {var_name}, which is not set"
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Registration used when none is named explicitly.
    ///
    /// Falls back to the only configured client when `default_client` is unset.
    pub fn default_registration(&self) -> Option<&str> {
        if let Some(id) = self.default_client.as_deref() {
            return Some(id);
        }
        if self.clients.len() == 1 {
            return self.clients.keys().next().map(String::as_str);
        }
        None
    }
}

/// Authorization server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// Issuer base URL (e.g. `http://localhost:8080/realms/demo`)
    pub base_url: String,
    /// Expected `iss` claim; defaults to the discovered issuer, then `base_url`
    pub expected_issuer: Option<String>,
    /// Token endpoint path relative to `base_url`, used when discovery is off
    pub token_endpoint_path: Option<String>,
    /// Explicit JWKS URI, skipping discovery for keys
    pub jwks_uri: Option<String>,
    /// Resolve missing endpoints through OpenID Connect discovery
    pub discovery: bool,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/realms/demo".to_string(),
            expected_issuer: None,
            token_endpoint_path: None,
            jwks_uri: None,
            discovery: true,
        }
    }
}

/// One configured OAuth2 client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// OAuth2 client id
    pub client_id: String,
    /// Client secret, literal or `env:NAME`
    pub client_secret: String,
    /// Token endpoint override for this client
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// Requested scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// How the client authenticates at the token endpoint
    #[serde(default)]
    pub auth_method: ClientAuthMethod,
}

/// Downstream service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Base URL of the protected service
    pub base_url: String,
    /// Path requested by `call`
    pub path: String,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            path: "/data".to_string(),
        }
    }
}

/// Outbound HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout for token, discovery, JWKS and downstream calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Token cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens closer than this to expiry are treated as expired
    #[serde(with = "humantime_serde")]
    pub refresh_skew: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_skew: Duration::from_secs(30),
        }
    }
}

/// Protected resource server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Leeway applied to `exp`/`nbf` checks
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// Signing keys older than this are refetched
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
    /// Minimum time between refetches triggered by an unknown key id
    #[serde(with = "humantime_serde")]
    pub jwks_min_refresh_gap: Duration,
    /// Paths served without a bearer token (none by default)
    pub public_paths: Vec<String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            clock_skew: Duration::from_secs(60),
            jwks_refresh_interval: Duration::from_secs(300),
            jwks_min_refresh_gap: Duration::from_secs(5),
            public_paths: Vec::new(),
        }
    }
}

impl ResourceConfig {
    /// Socket address to bind
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid bind address: {e}")))
    }
}

/// Retry configuration for token acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" first: it also ends in 's'
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
