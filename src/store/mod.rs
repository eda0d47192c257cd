//! Cache entries and the storage contract.
//!
//! The cache layer persists captured responses through a [`CacheStore`]
//! implementation. This module ships with [`memory::InMemoryStore`], a
//! process-local reference store; durable backends implement the same trait.
//!
//! Stores own their entries once handed to [`CacheStore::store`]. Entries
//! are immutable after that point: a later store under the same key replaces
//! the entry wholesale.

pub mod memory;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AGE, CACHE_CONTROL, ETAG, EXPIRES, LAST_MODIFIED};
use http::{response, HeaderName, HeaderValue, Method, Response, StatusCode, Uri, Version};
use http_body_util::Full;

use crate::directives::Directives;
use crate::error::{CacheError, NotCacheableReason};
use crate::freshness::{format_http_timestamp, FreshnessEvaluator};
use crate::key::{vary_header_names, CacheKey, CacheKeyBuilder, KeySource};

/// Connection-scoped headers that never belong in a stored response.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A captured origin response together with its cache metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Full key: resource identity plus the values of the `vary` headers.
    pub key: CacheKey,
    /// Resource-identity key the entry is indexed under.
    pub provisional_key: CacheKey,
    pub method: Method,
    pub uri: Uri,
    pub status: StatusCode,
    pub version: Version,
    /// Response headers in arrival order, names lower-cased.
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    pub stored_at: SystemTime,
    pub last_modified: SystemTime,
    pub expires_at: SystemTime,
    pub etag: Option<Bytes>,
    /// Lower-cased header names from the response's `Vary`, in declared order.
    pub vary: Vec<String>,
    /// Response directives, kept for later freshness decisions.
    pub directives: Directives,
}

impl CacheEntry {
    /// Builds an entry from a fully buffered origin response.
    ///
    /// `source` describes the request that missed; its header values at the
    /// response's `Vary` names finalize the key. Missing or malformed
    /// `Expires`/`Last-Modified` headers are replaced by computed defaults.
    pub fn capture(
        keys: &CacheKeyBuilder,
        freshness: &FreshnessEvaluator,
        source: &KeySource<'_>,
        response: &response::Parts,
        body: Bytes,
        now: SystemTime,
    ) -> Self {
        let directives = Directives::from_headers(&response.headers);
        let vary = vary_header_names(&response.headers);

        Self {
            key: keys.full(source, vary.as_slice()),
            provisional_key: keys.provisional(source),
            method: source.method.clone(),
            uri: source.uri.clone(),
            status: response.status,
            version: response.version,
            headers: response
                .headers
                .iter()
                .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
                .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
                .collect(),
            body,
            stored_at: now,
            last_modified: freshness.last_modified(&response.headers, now),
            expires_at: freshness.compute_expiration(&directives, &response.headers, now),
            etag: response
                .headers
                .get(ETAG)
                .map(|value| Bytes::copy_from_slice(value.as_bytes())),
            vary,
            directives,
        }
    }

    /// First stored value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(stored, _)| stored.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    /// Checks the storage invariant: no `private`/`no-store`/`no-cache`, no
    /// `Vary: *`, not already expired, and a non-zero key.
    pub fn validate(&self, now: SystemTime) -> Result<(), CacheError> {
        if let Some(directive) = self.directives.storage_forbidden_by() {
            return Err(CacheError::NotCacheable(NotCacheableReason::Directive(
                directive,
            )));
        }
        if self.vary.iter().any(|name| name == "*") {
            return Err(CacheError::NotCacheable(NotCacheableReason::VaryAny));
        }
        if self.expires_at < now {
            return Err(CacheError::NotCacheable(NotCacheableReason::Expired));
        }
        if self.key.is_zero() {
            return Err(CacheError::InvalidKey);
        }
        Ok(())
    }

    /// Renders the entry as a response served from cache at `now`.
    ///
    /// `Expires` and `Last-Modified` are filled in only when the origin did not
    /// send them. `Cache-Control` always carries the remaining freshness as
    /// `max-age`, and `Age` the seconds since the entry was stored.
    pub fn to_response(
        &self,
        freshness: &FreshnessEvaluator,
        now: SystemTime,
    ) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                if name != CACHE_CONTROL && name != AGE {
                    headers.append(name, value);
                }
            }
        }

        if !headers.contains_key(EXPIRES) {
            if let Ok(value) = HeaderValue::from_str(&format_http_timestamp(self.expires_at)) {
                headers.insert(EXPIRES, value);
            }
        }
        if !headers.contains_key(LAST_MODIFIED) {
            if let Ok(value) = HeaderValue::from_str(&format_http_timestamp(self.last_modified)) {
                headers.insert(LAST_MODIFIED, value);
            }
        }

        let remaining = freshness.remaining_freshness(self, now).as_secs();
        let cache_control = HeaderValue::from_str(&self.directives.with_max_age(remaining).to_string())
            .or_else(|_| HeaderValue::from_str(&format!("max-age={remaining}")));
        if let Ok(value) = cache_control {
            headers.insert(CACHE_CONTROL, value);
        }
        headers.insert(AGE, HeaderValue::from(freshness.age(self, now).as_secs()));

        response
    }
}

/// Storage contract for cached entries.
///
/// Every operation must be safe to call concurrently. A successful
/// [`store`](CacheStore::store) publishes atomically: readers observe either
/// the previous entry or the new one, never a partial write.
#[async_trait]
pub trait CacheStore: Send + Sync + Clone + 'static {
    /// Publishes `entry` under `entry.key`, indexing it under
    /// `entry.provisional_key`.
    ///
    /// Fails with [`CacheError::NotCacheable`] or [`CacheError::InvalidKey`]
    /// when [`CacheEntry::validate`] rejects the entry.
    async fn store(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Returns the most recently stored entry for `key`.
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, CacheError>;

    async fn has(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Returns every entry indexed under a provisional key.
    async fn variants(&self, provisional: &CacheKey) -> Result<Vec<Arc<CacheEntry>>, CacheError>;

    /// Removes the entry for `key`. Absent keys are not an error.
    async fn purge_item(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Removes every entry.
    async fn purge(&self) -> Result<(), CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;
}
