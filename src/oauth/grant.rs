//! Client-credentials grant exchange
//!
//! One POST to the token endpoint per call (RFC 6749 §4.4). No caching and no
//! retries happen here; both belong to the caller.

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

use super::registry::{ClientAuthMethod, ClientRegistration};

/// Longest error body kept from a failed token response
const MAX_ERROR_BODY: usize = 512;

/// Why a grant exchange failed
#[derive(Debug, Error)]
pub enum GrantError {
    /// Connection or protocol level failure
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
    /// Request did not complete within the HTTP client timeout
    #[error("token endpoint timed out")]
    Timeout,
    /// Token endpoint answered with a non-success status
    #[error("token endpoint returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },
    /// Response body was not a usable token response
    #[error("malformed token response: {0}")]
    Malformed(String),
}

impl GrantError {
    /// Whether repeating the exchange could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for GrantError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// A successful token response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedToken {
    /// Access token value
    pub access_token: String,
    /// Token type
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Granted scopes, when the server reported them
    pub scopes: Option<BTreeSet<String>>,
}

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    scope: Option<String>,
}

impl GrantedToken {
    /// Parse a token endpoint response body
    ///
    /// # Errors
    ///
    /// Returns [`GrantError::Malformed`] if the body is not JSON, lacks
    /// `access_token` or `expires_in`, or names a token type other than Bearer.
    pub fn parse(body: &str) -> Result<Self, GrantError> {
        let response: TokenResponse =
            serde_json::from_str(body).map_err(|e| GrantError::Malformed(e.to_string()))?;

        if response.access_token.is_empty() {
            return Err(GrantError::Malformed("empty access_token".to_string()));
        }
        let expires_in = response
            .expires_in
            .ok_or_else(|| GrantError::Malformed("missing expires_in".to_string()))?;

        let token_type = response.token_type.unwrap_or_else(|| "Bearer".to_string());
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(GrantError::Malformed(format!(
                "unsupported token_type '{token_type}'"
            )));
        }

        let scopes = response
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect());

        Ok(Self {
            access_token: response.access_token,
            token_type,
            expires_in,
            scopes,
        })
    }
}

/// Performs a client-credentials exchange for a registration
#[async_trait]
pub trait GrantExchanger: Send + Sync {
    /// Request a new access token
    async fn exchange(&self, registration: &ClientRegistration) -> Result<GrantedToken, GrantError>;
}

/// Grant exchange over HTTP
#[derive(Debug, Clone)]
pub struct HttpGrantExchanger {
    http_client: Client,
}

impl HttpGrantExchanger {
    /// Create an exchanger using the given HTTP client (and its timeout)
    #[must_use]
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl GrantExchanger for HttpGrantExchanger {
    async fn exchange(&self, registration: &ClientRegistration) -> Result<GrantedToken, GrantError> {
        let scope = registration.scope_param();
        let mut params: Vec<(&str, &str)> = vec![("grant_type", "client_credentials")];
        if let Some(scope) = scope.as_deref() {
            params.push(("scope", scope));
        }

        let mut request = self
            .http_client
            .post(registration.token_endpoint.as_str())
            .header(ACCEPT, "application/json");

        match registration.auth_method {
            ClientAuthMethod::Basic => {
                // RFC 6749 §2.3.1: credentials are form-encoded before base64
                let user = form_urlencoded::byte_serialize(registration.client_id.as_bytes())
                    .collect::<String>();
                let pass = form_urlencoded::byte_serialize(registration.client_secret().as_bytes())
                    .collect::<String>();
                request = request.basic_auth(user, Some(pass));
            }
            ClientAuthMethod::Post => {
                params.push(("client_id", &registration.client_id));
                params.push(("client_secret", registration.client_secret()));
            }
        }

        debug!(
            registration = %registration.registration_id,
            endpoint = %registration.token_endpoint,
            "Requesting client-credentials token"
        );

        let response = request.form(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(GrantError::Status {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        GrantedToken::parse(&body)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
