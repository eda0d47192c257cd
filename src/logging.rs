//! Structured cache event logging.
//!
//! Every decision the cache layer makes (hit, stale hit, miss, store, ...)
//! can be emitted as a single JSON event through `tracing` on the
//! `tower_response_cache::events` target. Events are off by default and can
//! be sampled.

use http::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, SystemTime};

use crate::key::CacheKey;

/// Target used for structured cache events.
pub const EVENT_TARGET: &str = "tower_response_cache::events";

/// Configuration for structured cache events.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Emit events at all
    pub enabled: bool,

    /// Sample rate (1.0 = every request, 0.1 = 10%)
    pub sample_rate: f64,

    /// Include request URIs; disable when paths or queries carry personal data
    pub include_uri: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 1.0,
            include_uri: true,
        }
    }
}

impl EventLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the sample rate, clamped to `0.0..=1.0`.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_include_uri(mut self, include: bool) -> Self {
        self.include_uri = include;
        self
    }

    /// Checks if an event should be emitted under the sampling rate.
    pub fn should_sample(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        use std::collections::hash_map::RandomState;
        use std::hash::BuildHasher;

        let random = (RandomState::new().hash_one(SystemTime::now()) as f64) / (u64::MAX as f64);
        random < self.sample_rate
    }
}

/// Kinds of cache events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventType {
    /// Fresh entry served
    Hit,
    /// Expired entry served within the request's `max-stale`
    StaleHit,
    /// No acceptable entry; request forwarded to the origin
    Miss,
    /// Method not cache-eligible; request passed through untouched
    Bypass,
    /// `only-if-cached` request with no acceptable entry
    OnlyIfCachedMiss,
    /// Captured response published to the store
    Store,
    /// Captured response refused by policy or by the store
    StoreRejected,
    /// Entry or store purged
    Purge,
}

/// One structured cache event.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub timestamp: SystemTime,
    pub event_type: CacheEventType,
    /// Taken from an incoming `x-request-id` header, when present
    pub request_id: Option<String>,
    pub key: Option<CacheKey>,
    pub method: Option<Method>,
    pub uri: Option<Uri>,
    pub status: Option<StatusCode>,
    /// Remaining freshness of the entry involved
    pub remaining: Option<Duration>,
    pub size_bytes: Option<usize>,
    /// Why a response was not stored
    pub reason: Option<String>,
}

impl CacheEvent {
    pub fn new(event_type: CacheEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type,
            request_id: None,
            key: None,
            method: None,
            uri: None,
            status: None,
            remaining: None,
            size_bytes: None,
            reason: None,
        }
    }

    pub fn with_request(mut self, method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        self.method = Some(method.clone());
        self.uri = Some(uri.clone());
        self.request_id = headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        self
    }

    pub fn with_key(mut self, key: CacheKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_remaining(mut self, remaining: Duration) -> Self {
        self.remaining = Some(remaining);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Renders the event as the JSON object that gets logged.
    pub fn to_json(&self, config: &EventLogConfig) -> serde_json::Value {
        json!({
            "timestamp": chrono::DateTime::<chrono::Utc>::from(self.timestamp)
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "event": self.event_type,
            "request_id": self.request_id,
            "key": self.key.map(|key| key.to_hex()),
            "method": self.method.as_ref().map(|m| m.as_str()),
            "uri": self
                .uri
                .as_ref()
                .filter(|_| config.include_uri)
                .map(|u| u.to_string()),
            "status": self.status.map(|s| s.as_u16()),
            "remaining_seconds": self.remaining.map(|r| r.as_secs()),
            "size_bytes": self.size_bytes,
            "reason": self.reason,
        })
    }

    /// Emits this event if the configuration samples it.
    pub fn log(&self, config: &EventLogConfig) {
        if !config.should_sample() {
            return;
        }

        let _log_data = self.to_json(config);

        #[cfg(feature = "tracing")]
        tracing::info!(target: EVENT_TARGET, event = %_log_data);
    }
}
