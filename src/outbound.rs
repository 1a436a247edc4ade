//! Outbound calls to the protected downstream service

use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Response from the downstream service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Body as text
    pub body: String,
}

/// Issues bearer-authenticated requests to one downstream base URL
#[derive(Debug, Clone)]
pub struct OutboundCaller {
    http_client: Client,
    base_url: Url,
}

impl OutboundCaller {
    /// Create a caller for `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not a valid URL.
    pub fn new(http_client: Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid downstream URL '{base_url}': {e}")))?;
        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// Full URL for `path`
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be joined onto the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}/{}", path.trim_start_matches('/')));
        Ok(url)
    }

    /// `GET {base_url}{path}` with `Authorization: Bearer <token>`.
    ///
    /// Any status is returned; interpreting it is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure.
    pub async fn get(&self, path: &str, token: &str) -> Result<DownstreamResponse> {
        let url = self.url_for(path)?;
        debug!(url = %url, "Calling downstream service");

        let response = self.http_client.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        let body = response.text().await?;

        Ok(DownstreamResponse { status, body })
    }
}
