//! Startup wiring
//!
//! Builds the client side (registry, cache, exchanger, manager) and the
//! resource side (key source, validator, gate) from configuration, in
//! dependency order.

use std::sync::Arc;

use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use crate::config::{Config, HttpConfig};
use crate::oauth::{
    AuthError, AuthorizeRequest, AuthorizedClientManager, ClientRegistry, HttpGrantExchanger,
    IssuerEndpoints, TokenCache,
};
use crate::outbound::{DownstreamResponse, OutboundCaller};
use crate::resource::{
    AlwaysAdmitIfValid, HttpKeySource, RequestGate, SigningKeyCache, TokenValidator,
};
use crate::retry::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// Longest downstream error body kept in an error
const MAX_ERROR_BODY: usize = 512;

/// HTTP client shared by grant, discovery, JWKS and downstream calls
///
/// # Errors
///
/// Returns an error if the client cannot be constructed.
pub fn build_http_client(config: &HttpConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(Error::Http)
}

/// Everything needed to call the downstream service with a token
pub struct ClientSide {
    /// Token manager
    pub manager: Arc<AuthorizedClientManager>,
    /// Downstream caller
    pub outbound: OutboundCaller,
    /// Retry policy for token acquisition
    pub retry: RetryPolicy,
}

impl ClientSide {
    /// Build from configuration, running discovery if a token endpoint is missing
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails or a registration is invalid.
    pub async fn build(config: &Config, http: Client) -> Result<Self> {
        let all_explicit = config.issuer.token_endpoint_path.is_some()
            || config.clients.values().all(|c| c.token_endpoint.is_some());
        let endpoints = if all_explicit {
            IssuerEndpoints::from_config(&config.issuer)
        } else {
            IssuerEndpoints::resolve(&config.issuer, &http).await?
        };

        let registry = Arc::new(ClientRegistry::from_config(
            config,
            endpoints.token_endpoint.as_deref(),
        )?);
        info!(clients = ?registry.ids(), "Client registry loaded");

        let cache = Arc::new(TokenCache::new());
        let exchanger = Arc::new(HttpGrantExchanger::new(http.clone()));
        let manager = Arc::new(AuthorizedClientManager::new(
            registry,
            cache,
            exchanger,
            config.cache.refresh_skew,
        ));

        Ok(Self {
            manager,
            outbound: OutboundCaller::new(http, &config.downstream.base_url)?,
            retry: RetryPolicy::new(&config.retry),
        })
    }

    /// Acquire a token, retrying transient grant failures
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
    ) -> std::result::Result<String, AuthError> {
        with_retry(&self.retry, "authorize", AuthError::is_retryable, || {
            self.manager.authorize(request)
        })
        .await
    }

    /// Call `path` downstream with a token for `request`.
    ///
    /// A 401 from downstream drops the cached token and the call is repeated
    /// once with a freshly granted one. Transient failures are retried per the
    /// retry policy: retryable grant errors, timeouts, connection failures,
    /// and downstream 5xx or 429 answers.
    ///
    /// # Errors
    ///
    /// Returns an error if no token can be acquired, the call fails, or the
    /// downstream answers with a non-success status.
    pub async fn call(&self, request: &AuthorizeRequest, path: &str) -> Result<DownstreamResponse> {
        with_retry(&self.retry, "call", Error::is_retryable, || {
            self.call_once(request, path)
        })
        .await
    }

    async fn call_once(&self, request: &AuthorizeRequest, path: &str) -> Result<DownstreamResponse> {
        let token = self.manager.authorize(request).await?;
        let mut response = self.outbound.get(path, &token).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            warn!(
                registration = %request.registration_id,
                "Downstream rejected token, re-authorizing"
            );
            self.manager.invalidate(&request.cache_key());
            let token = self.manager.authorize(request).await?;
            response = self.outbound.get(path, &token).await?;
        }

        if !response.status.is_success() {
            let mut body = response.body;
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(Error::Downstream {
                status: response.status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Build the request gate, running discovery if the JWKS URI is missing
///
/// # Errors
///
/// Returns an error if discovery fails or no JWKS URI can be determined.
pub async fn build_gate(config: &Config, http: Client) -> Result<Arc<RequestGate>> {
    let endpoints = if config.issuer.jwks_uri.is_some() {
        IssuerEndpoints::from_config(&config.issuer)
    } else {
        IssuerEndpoints::resolve(&config.issuer, &http).await?
    };

    let jwks_uri = endpoints.jwks_uri.ok_or_else(|| {
        Error::Config("No JWKS URI configured and the issuer did not provide one".to_string())
    })?;
    info!(issuer = %endpoints.issuer, jwks_uri = %jwks_uri, "Validating tokens");

    let source = Arc::new(HttpKeySource::new(http, jwks_uri));
    let keys = Arc::new(
        SigningKeyCache::new(source, config.resource.jwks_refresh_interval)
            .with_min_refresh_gap(config.resource.jwks_min_refresh_gap),
    );
    let validator = Arc::new(
        TokenValidator::new(keys, endpoints.issuer).with_leeway(config.resource.clock_skew),
    );

    Ok(Arc::new(RequestGate::new(
        validator,
        Arc::new(AlwaysAdmitIfValid),
        config.resource.public_paths.clone(),
    )))
}
