//! In-memory token cache
//!
//! Maps `(registration id, principal)` to the last token granted for that
//! pair. Entries are whole `Arc<CachedToken>` values swapped under the shard
//! lock, so readers never observe a partially written token.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

use super::grant::GrantedToken;

/// Identity of one cached token slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Client registration id
    pub registration_id: String,
    /// Name of the principal the token is used on behalf of
    pub principal: String,
}

impl CacheKey {
    /// Create a key
    pub fn new(registration_id: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            registration_id: registration_id.into(),
            principal: principal.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registration_id, self.principal)
    }
}

/// A granted access token and its expiry
#[derive(Clone)]
pub struct CachedToken {
    /// Opaque token value
    pub value: String,
    /// Token type, normally `Bearer`
    pub token_type: String,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Scopes granted (or requested, when the server did not echo them)
    pub scopes: BTreeSet<String>,
}

impl CachedToken {
    /// Build a cache entry from a grant response received at `now`.
    ///
    /// When the response carries no `scope`, the requested scopes are recorded.
    pub fn from_grant(granted: GrantedToken, requested: &BTreeSet<String>, now: DateTime<Utc>) -> Self {
        let lifetime = i64::try_from(granted.expires_in)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        let expires_at = now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            value: granted.access_token,
            token_type: granted.token_type,
            expires_at,
            scopes: granted.scopes.unwrap_or_else(|| requested.clone()),
        }
    }

    /// Whether the token has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the token is still usable for at least `skew` after `now`
    pub fn is_fresh_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        TimeDelta::from_std(skew)
            .ok()
            .and_then(|skew| now.checked_add_signed(skew))
            .is_some_and(|deadline| deadline < self.expires_at)
    }
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("value", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    /// Lookups served from the cache
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing usable
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Calculate hit rate as a fraction (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Thread-safe token cache
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: DashMap<CacheKey, Arc<CachedToken>>,
    stats: CacheStats,
}

impl TokenCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the token for `key` unless it has expired.
    ///
    /// Expired entries are evicted and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedToken>> {
        let now = Utc::now();
        let found = self.peek(key, now, Duration::ZERO);
        if found.is_none() {
            self.entries.remove_if(key, |_, token| token.is_expired_at(now));
        }
        self.stats.record(found.is_some());
        found
    }

    /// Get the token for `key` only if it stays valid for longer than `skew`
    pub fn get_fresh(&self, key: &CacheKey, skew: Duration) -> Option<Arc<CachedToken>> {
        let found = self.peek(key, Utc::now(), skew);
        self.stats.record(found.is_some());
        found
    }

    /// Like [`get_fresh`](Self::get_fresh) without touching the statistics
    pub fn peek_fresh(&self, key: &CacheKey, skew: Duration) -> Option<Arc<CachedToken>> {
        self.peek(key, Utc::now(), skew)
    }

    fn peek(&self, key: &CacheKey, now: DateTime<Utc>, skew: Duration) -> Option<Arc<CachedToken>> {
        self.entries
            .get(key)
            .filter(|token| token.is_fresh_at(now, skew))
            .map(|token| Arc::clone(token.value()))
    }

    /// Store a token, replacing any previous one for the same key
    pub fn put(&self, key: CacheKey, token: CachedToken) {
        self.entries.insert(key, Arc::new(token));
    }

    /// Drop the token for `key`
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CachedToken>> {
        self.entries.remove(key).map(|(_, token)| token)
    }

    /// Number of stored entries, including ones that have expired but not been read
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
