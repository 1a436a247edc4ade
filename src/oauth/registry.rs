//! Client Registry
//!
//! Static set of OAuth2 client registrations, loaded once at startup.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::{Error, Result};

/// How a client authenticates itself at the token endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `Authorization: Basic` header (`client_secret_basic`)
    #[default]
    #[serde(alias = "client_secret_basic")]
    Basic,
    /// `client_id`/`client_secret` form fields (`client_secret_post`)
    #[serde(alias = "client_secret_post")]
    Post,
}

/// One known OAuth2 client
#[derive(Clone)]
pub struct ClientRegistration {
    /// Registration id used by callers to name this client
    pub registration_id: String,
    /// OAuth2 client id
    pub client_id: String,
    client_secret: String,
    /// Token endpoint of the authorization server
    pub token_endpoint: Url,
    /// Scopes requested with every grant
    pub scopes: BTreeSet<String>,
    /// Client authentication method
    pub auth_method: ClientAuthMethod,
}

impl ClientRegistration {
    /// Create a registration with no scopes and Basic client authentication
    ///
    /// # Errors
    ///
    /// Returns an error if the token endpoint is not an absolute http(s) URL.
    pub fn new(
        registration_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: &str,
    ) -> Result<Self> {
        let registration_id = registration_id.into();
        let token_endpoint = Url::parse(token_endpoint).map_err(|e| {
            Error::Config(format!(
                "Client '{registration_id}' has invalid token endpoint '{token_endpoint}': {e}"
            ))
        })?;
        if !matches!(token_endpoint.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Client '{registration_id}' token endpoint must be http(s): {token_endpoint}"
            )));
        }

        Ok(Self {
            registration_id,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_endpoint,
            scopes: BTreeSet::new(),
            auth_method: ClientAuthMethod::Basic,
        })
    }

    /// Set the requested scopes
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the client authentication method
    #[must_use]
    pub fn with_auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Client secret
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Space-separated `scope` parameter, if any scopes are requested
    pub fn scope_param(&self) -> Option<String> {
        if self.scopes.is_empty() {
            None
        } else {
            Some(self.scopes.iter().map(String::as_str).collect::<Vec<_>>().join(" "))
        }
    }
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("registration_id", &self.registration_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("scopes", &self.scopes)
            .field("auth_method", &self.auth_method)
            .finish()
    }
}

/// Read-only lookup of client registrations by id
#[derive(Debug, Default)]
pub struct ClientRegistry {
    registrations: HashMap<String, Arc<ClientRegistration>>,
}

impl ClientRegistry {
    /// Build a registry from a set of registrations
    ///
    /// # Errors
    ///
    /// Returns an error if two registrations share an id.
    pub fn new(registrations: impl IntoIterator<Item = ClientRegistration>) -> Result<Self> {
        let mut map = HashMap::new();
        for registration in registrations {
            let id = registration.registration_id.clone();
            if map.insert(id.clone(), Arc::new(registration)).is_some() {
                return Err(Error::Config(format!(
                    "Duplicate client registration id: {id}"
                )));
            }
        }
        Ok(Self { registrations: map })
    }

    /// Build the registry from configuration.
    ///
    /// Clients without their own `token_endpoint` use `default_token_endpoint`,
    /// normally the issuer's endpoint resolved at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if a client has no usable token endpoint.
    pub fn from_config(config: &Config, default_token_endpoint: Option<&str>) -> Result<Self> {
        let registrations = config
            .clients
            .iter()
            .map(|(id, client)| {
                let endpoint = client
                    .token_endpoint
                    .as_deref()
                    .or(default_token_endpoint)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "Client '{id}' has no token endpoint and the issuer did not provide one"
                        ))
                    })?;
                Ok(
                    ClientRegistration::new(id, &client.client_id, &client.client_secret, endpoint)?
                        .with_scopes(client.scopes.iter().cloned())
                        .with_auth_method(client.auth_method),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(registrations)
    }

    /// Look up a registration
    pub fn get(&self, registration_id: &str) -> Option<Arc<ClientRegistration>> {
        self.registrations.get(registration_id).cloned()
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.registrations.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
