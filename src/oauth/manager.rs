//! Authorized client manager
//!
//! Returns a valid access token for a `(registration, principal)` pair,
//! serving it from the [`TokenCache`] when possible and running a
//! client-credentials grant otherwise.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, CachedToken, TokenCache};
use super::grant::{GrantError, GrantExchanger};
use super::registry::ClientRegistry;

/// Token acquisition failure
#[derive(Debug, Error)]
pub enum AuthError {
    /// No registration with this id exists
    #[error("Unknown client registration: {0}")]
    UnknownClient(String),
    /// The grant exchange failed
    #[error("Client credentials grant failed for '{registration}': {cause}")]
    GrantFailure {
        /// Registration the grant was attempted for
        registration: String,
        /// Underlying failure
        #[source]
        cause: GrantError,
    },
}

impl AuthError {
    /// Whether repeating the request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnknownClient(_) => false,
            Self::GrantFailure { cause, .. } => cause.is_retryable(),
        }
    }
}

/// Request for a token on behalf of a principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeRequest {
    /// Client registration id
    pub registration_id: String,
    /// Principal name
    pub principal: String,
}

impl AuthorizeRequest {
    /// Create a request
    pub fn new(registration_id: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            registration_id: registration_id.into(),
            principal: principal.into(),
        }
    }

    /// Cache slot this request reads and writes
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.registration_id, &self.principal)
    }
}

/// Acquires, caches and refreshes client-credentials tokens
pub struct AuthorizedClientManager {
    registry: Arc<ClientRegistry>,
    cache: Arc<TokenCache>,
    exchanger: Arc<dyn GrantExchanger>,
    refresh_skew: Duration,
    /// One guard per cache slot so concurrent misses share a single grant
    flow_guards: DashMap<CacheKey, Arc<AsyncMutex<()>>>,
}

impl AuthorizedClientManager {
    /// Create a manager
    pub fn new(
        registry: Arc<ClientRegistry>,
        cache: Arc<TokenCache>,
        exchanger: Arc<dyn GrantExchanger>,
        refresh_skew: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            exchanger,
            refresh_skew,
            flow_guards: DashMap::new(),
        }
    }

    /// Return a valid access token for the request.
    ///
    /// A cached token that stays valid beyond the refresh skew is returned
    /// without network I/O. Otherwise one grant is performed and its result
    /// cached. A failed grant leaves the cache untouched and is not retried.
    /// If the returned future is dropped mid-grant, nothing is cached.
    pub async fn authorize(&self, request: &AuthorizeRequest) -> Result<String, AuthError> {
        let key = request.cache_key();

        if let Some(token) = self.cache.get_fresh(&key, self.refresh_skew) {
            debug!(key = %key, "Using cached access token");
            return Ok(token.value.clone());
        }

        let registration = self
            .registry
            .get(&request.registration_id)
            .ok_or_else(|| AuthError::UnknownClient(request.registration_id.clone()))?;

        let lease = self.flight_lease(&key);
        let _flight = lease.mutex.lock().await;

        // Another task may have completed the grant while we waited
        if let Some(token) = self.cache.peek_fresh(&key, self.refresh_skew) {
            debug!(key = %key, "Access token obtained by concurrent request");
            return Ok(token.value.clone());
        }

        let granted = self
            .exchanger
            .exchange(&registration)
            .await
            .map_err(|cause| {
                warn!(key = %key, error = %cause, "Client credentials grant failed");
                AuthError::GrantFailure {
                    registration: registration.registration_id.clone(),
                    cause,
                }
            })?;

        let token = CachedToken::from_grant(granted, &registration.scopes, Utc::now());
        info!(
            key = %key,
            expires_at = %token.expires_at,
            "Obtained access token"
        );

        let value = token.value.clone();
        self.cache.put(key, token);
        Ok(value)
    }

    /// Drop the cached token for `key`, forcing the next call to re-grant
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.cache.remove(key).is_some();
        if removed {
            debug!(key = %key, "Invalidated cached access token");
        }
        removed
    }

    /// The token cache
    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// The client registry
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    fn flight_lease(&self, key: &CacheKey) -> FlightLease<'_> {
        let mutex = Arc::clone(&self.flow_guards.entry(key.clone()).or_default());
        FlightLease {
            guards: &self.flow_guards,
            key: key.clone(),
            mutex,
        }
    }
}

/// Shared handle on a cache slot's guard.
///
/// The last lease to go away removes the guard from the map, so the map only
/// holds slots with a grant in progress. Runs on cancellation too.
struct FlightLease<'a> {
    guards: &'a DashMap<CacheKey, Arc<AsyncMutex<()>>>,
    key: CacheKey,
    mutex: Arc<AsyncMutex<()>>,
}

impl Drop for FlightLease<'_> {
    fn drop(&mut self) {
        // Two references left means the map's and ours. New leases clone
        // under the same shard lock, so the count cannot grow meanwhile.
        self.guards.remove_if(&self.key, |_, mutex| {
            Arc::ptr_eq(mutex, &self.mutex) && Arc::strong_count(mutex) == 2
        });
    }
}
