//! OpenID Connect Discovery
//!
//! Resolves the issuer's token endpoint and JWKS URI from
//! `{issuer}/.well-known/openid-configuration` when they are not configured.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::config::IssuerConfig;
use crate::{Error, Result};

/// OpenID Provider Metadata (OIDC Discovery 1.0 §3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,

    /// Token endpoint URL
    #[serde(default)]
    pub token_endpoint: Option<String>,

    /// JWK set URL
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported token endpoint auth methods
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,
}

/// Deserialize scopes that may be either a string or array
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

/// Discovery document URL for an issuer
pub fn well_known_url(issuer: &str) -> String {
    format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    )
}

impl ProviderMetadata {
    /// Fetch provider metadata for `issuer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is unreachable, invalid, or names a
    /// different issuer than the one it was fetched for.
    pub async fn discover(client: &Client, issuer: &str) -> Result<Self> {
        let url = well_known_url(issuer);
        debug!(url = %url, "Discovering OpenID provider metadata");

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("Failed to fetch {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Discovery(format!(
                "{url} returned HTTP {}",
                response.status()
            )));
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("Failed to parse provider metadata: {e}")))?;

        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(Error::Discovery(format!(
                "Provider metadata issuer '{}' does not match '{issuer}'",
                metadata.issuer
            )));
        }

        debug!(issuer = %metadata.issuer, "Discovered OpenID provider");
        Ok(metadata)
    }

    /// Whether the provider advertises the client-credentials grant.
    ///
    /// An empty `grant_types_supported` is taken as "unknown" and passes.
    pub fn supports_client_credentials(&self) -> bool {
        self.grant_types_supported.is_empty()
            || self
                .grant_types_supported
                .iter()
                .any(|g| g == "client_credentials")
    }
}

/// Endpoints of the issuer, after applying configuration and discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerEndpoints {
    /// Expected `iss` claim
    pub issuer: String,
    /// Token endpoint, if known
    pub token_endpoint: Option<String>,
    /// JWK set URL, if known
    pub jwks_uri: Option<String>,
}

impl IssuerEndpoints {
    /// Endpoints derived from configuration alone
    pub fn from_config(config: &IssuerConfig) -> Self {
        let base = config.base_url.trim_end_matches('/');
        Self {
            issuer: config
                .expected_issuer
                .clone()
                .unwrap_or_else(|| base.to_string()),
            token_endpoint: config
                .token_endpoint_path
                .as_deref()
                .map(|path| format!("{base}/{}", path.trim_start_matches('/'))),
            jwks_uri: config.jwks_uri.clone(),
        }
    }

    /// Resolve endpoints, running discovery only when something is missing
    ///
    /// # Errors
    ///
    /// Returns an error if discovery is needed and fails.
    pub async fn resolve(config: &IssuerConfig, client: &Client) -> Result<Self> {
        let mut endpoints = Self::from_config(config);
        let complete = endpoints.token_endpoint.is_some() && endpoints.jwks_uri.is_some();
        if complete || !config.discovery {
            return Ok(endpoints);
        }

        let metadata = ProviderMetadata::discover(client, &config.base_url).await?;
        if !metadata.supports_client_credentials() {
            tracing::warn!(
                issuer = %metadata.issuer,
                "Provider does not advertise the client_credentials grant"
            );
        }

        if config.expected_issuer.is_none() {
            endpoints.issuer = metadata.issuer;
        }
        if endpoints.token_endpoint.is_none() {
            endpoints.token_endpoint = metadata.token_endpoint;
        }
        if endpoints.jwks_uri.is_none() {
            endpoints.jwks_uri = metadata.jwks_uri;
        }

        info!(
            issuer = %endpoints.issuer,
            token_endpoint = ?endpoints.token_endpoint,
            jwks_uri = ?endpoints.jwks_uri,
            "Resolved issuer endpoints"
        );
        Ok(endpoints)
    }
}
