//! Issuer signing keys: JWKS fetching and caching.
//!
//! Keys are held as an immutable snapshot swapped on refresh. A refresh
//! happens when the snapshot is older than the refresh interval, or when a
//! token names a `kid` the snapshot lacks. Fetch attempts, failed or not,
//! are spaced by a minimum gap, and callers waiting on an in-flight fetch
//! share its outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, PublicKeyUse};
use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Failure to obtain the issuer's key set
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyDiscoveryError {
    /// Network or HTTP client failure
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),
    /// JWKS endpoint answered with a non-success status
    #[error("JWKS endpoint returned HTTP {0}")]
    Status(u16),
    /// Body was not a JWK set
    #[error("JWKS document is malformed: {0}")]
    Malformed(String),
}

/// Source of the issuer's published keys
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the current key set
    async fn fetch(&self) -> Result<JwkSet, KeyDiscoveryError>;
}

/// Fetches a JWK set over HTTP
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    http: Client,
    jwks_uri: String,
}

impl HttpKeySource {
    /// Create a source for `jwks_uri`
    pub fn new(http: Client, jwks_uri: impl Into<String>) -> Self {
        Self {
            http,
            jwks_uri: jwks_uri.into(),
        }
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyDiscoveryError> {
        debug!(jwks_uri = %self.jwks_uri, "Fetching JWKS");
        let response = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| KeyDiscoveryError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KeyDiscoveryError::Status(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| KeyDiscoveryError::Fetch(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| KeyDiscoveryError::Malformed(e.to_string()))
    }
}

/// Key set as of one fetch
struct KeySnapshot {
    keys: Arc<HashMap<String, DecodingKey>>,
    fetched_at: Instant,
}

/// Outcome of the latest fetch, successful or not
struct FetchAttempt {
    finished_at: Instant,
    outcome: Result<usize, KeyDiscoveryError>,
}

/// Decoding keys by `kid`, refreshed from a [`KeySource`]
pub struct SigningKeyCache {
    source: Arc<dyn KeySource>,
    snapshot: RwLock<Option<KeySnapshot>>,
    last_attempt: RwLock<Option<FetchAttempt>>,
    refresh_interval: Duration,
    min_refresh_gap: Duration,
    /// Serializes fetches so a burst of misses causes one request
    refresh_lock: AsyncMutex<()>,
}

impl SigningKeyCache {
    /// Create an empty cache; the first lookup fetches
    pub fn new(source: Arc<dyn KeySource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            snapshot: RwLock::new(None),
            last_attempt: RwLock::new(None),
            refresh_interval,
            min_refresh_gap: Duration::from_secs(5),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    /// Set the minimum time after a fetch before an unknown `kid` or a failed
    /// fetch may trigger another one
    #[must_use]
    pub fn with_min_refresh_gap(mut self, gap: Duration) -> Self {
        self.min_refresh_gap = gap;
        self
    }

    /// Find the key for `kid`.
    ///
    /// Returns `Ok(None)` if the key is still unknown after a refresh, or if
    /// a refresh is not permitted yet. While the last fetch failed less than
    /// the minimum gap ago and no fresh snapshot exists, that failure is
    /// returned without fetching again.
    pub async fn get(&self, kid: &str) -> Result<Option<DecodingKey>, KeyDiscoveryError> {
        let recent = self.recent_attempt();

        match self.current() {
            Some((keys, age)) if age < self.refresh_interval => {
                if let Some(key) = keys.get(kid) {
                    return Ok(Some(key.clone()));
                }
                if recent.is_some() {
                    debug!(kid = %kid, "Unknown key id, refresh suppressed");
                    return Ok(None);
                }
                debug!(kid = %kid, "Unknown key id, refreshing JWKS");
            }
            _ => {
                if let Some(Err(e)) = recent {
                    debug!(error = %e, "JWKS fetch failed recently, not retrying yet");
                    return Err(e);
                }
            }
        }

        self.refresh().await?;
        Ok(self.current().and_then(|(keys, _)| keys.get(kid).cloned()))
    }

    /// Fetch the key set now, replacing the cached one.
    ///
    /// Concurrent callers share a fetch: a caller that waited while another
    /// fetch finished gets that fetch's outcome, success or failure, without
    /// fetching again.
    pub async fn refresh(&self) -> Result<usize, KeyDiscoveryError> {
        let requested_at = Instant::now();
        let _guard = self.refresh_lock.lock().await;

        if let Some(outcome) = self.attempted_since(requested_at) {
            return outcome;
        }

        let outcome = match self.source.fetch().await {
            Ok(jwks) => {
                let keys = decode_key_set(&jwks);
                let count = keys.len();
                info!(keys = count, "Loaded issuer signing keys");
                *self.snapshot.write() = Some(KeySnapshot {
                    keys: Arc::new(keys),
                    fetched_at: Instant::now(),
                });
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "Signing key refresh failed");
                Err(e)
            }
        };

        *self.last_attempt.write() = Some(FetchAttempt {
            finished_at: Instant::now(),
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Number of usable keys currently cached
    pub fn len(&self) -> usize {
        self.snapshot.read().as_ref().map_or(0, |s| s.keys.len())
    }

    /// Whether no keys are cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Option<(Arc<HashMap<String, DecodingKey>>, Duration)> {
        self.snapshot
            .read()
            .as_ref()
            .map(|s| (Arc::clone(&s.keys), s.fetched_at.elapsed()))
    }

    /// Outcome of a fetch that finished after `instant`
    fn attempted_since(&self, instant: Instant) -> Option<Result<usize, KeyDiscoveryError>> {
        self.last_attempt
            .read()
            .as_ref()
            .filter(|a| a.finished_at > instant)
            .map(|a| a.outcome.clone())
    }

    /// Outcome of a fetch that finished less than the minimum gap ago
    fn recent_attempt(&self) -> Option<Result<usize, KeyDiscoveryError>> {
        self.last_attempt
            .read()
            .as_ref()
            .filter(|a| a.finished_at.elapsed() < self.min_refresh_gap)
            .map(|a| a.outcome.clone())
    }
}

/// Convert the signature-verification keys of a JWK set, keyed by `kid`.
///
/// Keys without a `kid`, encryption keys and symmetric keys are skipped.
fn decode_key_set(jwks: &JwkSet) -> HashMap<String, DecodingKey> {
    jwks.keys
        .iter()
        .filter_map(|jwk| {
            let kid = jwk.common.key_id.as_deref()?;
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                debug!(kid = %kid, "Skipping encryption key");
                return None;
            }
            decoding_key(jwk).map(|key| (kid.to_string(), key))
        })
        .collect()
}

fn decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    let kid = jwk.common.key_id.as_deref().unwrap_or("");
    let result = match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y),
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x),
        AlgorithmParameters::OctetKey(_) => {
            debug!(kid = %kid, "Skipping symmetric key");
            return None;
        }
    };
    match result {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(kid = %kid, error = %e, "Ignoring unusable JWK");
            None
        }
    }
}
