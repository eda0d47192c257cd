//! Freshness lifetime and staleness evaluation.
//!
//! Expiration is computed once, when a response is captured, with this
//! precedence: `s-maxage` (this is a shared cache), then `max-age`, then a
//! well-formed `Expires`, then the heuristic [`DEFAULT_LIFETIME`]. Staleness
//! is evaluated lazily whenever an entry is read.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::header::{HeaderName, EXPIRES, LAST_MODIFIED};
use http::HeaderMap;

use crate::directives::{Directive, Directives, MAX_DELTA_SECONDS};
use crate::error::ParseError;
use crate::store::CacheEntry;

/// Heuristic freshness lifetime for responses without explicit expiration.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of checking a stored entry against a request's directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptability {
    Fresh,
    /// Expired, but within the staleness the request tolerates.
    StaleAcceptable,
    Unacceptable,
}

impl Acceptability {
    pub fn is_acceptable(self) -> bool {
        !matches!(self, Self::Unacceptable)
    }
}

/// Computes expiration instants and judges stored entries against requests.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessEvaluator {
    default_lifetime: Duration,
}

impl Default for FreshnessEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_LIFETIME)
    }
}

impl FreshnessEvaluator {
    pub fn new(default_lifetime: Duration) -> Self {
        Self { default_lifetime }
    }

    pub fn default_lifetime(&self) -> Duration {
        self.default_lifetime
    }

    /// Absolute expiration instant for a response captured at `now`.
    pub fn compute_expiration(
        &self,
        directives: &Directives,
        headers: &HeaderMap,
        now: SystemTime,
    ) -> SystemTime {
        if let Some(lifetime) = directives.s_maxage() {
            return expires_after(now, lifetime);
        }
        if let Some(lifetime) = directives.max_age() {
            return expires_after(now, lifetime);
        }
        if let Some(expires) = header_timestamp(headers, EXPIRES) {
            return expires;
        }
        expires_after(now, self.default_lifetime)
    }

    /// `Last-Modified` when present and well-formed, otherwise `now`.
    pub fn last_modified(&self, headers: &HeaderMap, now: SystemTime) -> SystemTime {
        header_timestamp(headers, LAST_MODIFIED).unwrap_or(now)
    }

    pub fn is_expired(&self, entry: &CacheEntry, now: SystemTime) -> bool {
        entry.expires_at != UNIX_EPOCH && entry.expires_at < now
    }

    /// Whole seconds of freshness left, zero once expired.
    pub fn remaining_freshness(&self, entry: &CacheEntry, now: SystemTime) -> Duration {
        entry
            .expires_at
            .duration_since(now)
            .map(|left| Duration::from_secs(left.as_secs()))
            .unwrap_or(Duration::ZERO)
    }

    /// Whole seconds since the entry was stored.
    pub fn age(&self, entry: &CacheEntry, now: SystemTime) -> Duration {
        now.duration_since(entry.stored_at)
            .map(|age| Duration::from_secs(age.as_secs()))
            .unwrap_or(Duration::ZERO)
    }

    /// How far past its expiration the entry is, zero while fresh.
    pub fn staleness(&self, entry: &CacheEntry, now: SystemTime) -> Duration {
        now.duration_since(entry.expires_at).unwrap_or(Duration::ZERO)
    }

    /// Decides whether `entry` may answer a request carrying `request`
    /// directives.
    ///
    /// A fresh entry is acceptable unless the request sent `no-cache`, a
    /// `max-age` the entry's age exceeds, or a `min-fresh` the remaining
    /// freshness cannot cover. An expired entry is acceptable only when the
    /// request's `max-stale` covers the staleness and the response did not
    /// forbid serving it stale.
    pub fn is_acceptable(
        &self,
        entry: &CacheEntry,
        request: &Directives,
        now: SystemTime,
    ) -> Acceptability {
        if request.contains(Directive::NoCache) {
            return Acceptability::Unacceptable;
        }
        if let Some(max_age) = request.max_age() {
            if now.duration_since(entry.stored_at).unwrap_or_default() > max_age {
                return Acceptability::Unacceptable;
            }
        }

        if !self.is_expired(entry, now) {
            return match request.min_fresh() {
                Some(min_fresh) if self.remaining_freshness(entry, now) < min_fresh => {
                    Acceptability::Unacceptable
                }
                _ => Acceptability::Fresh,
            };
        }

        if !entry.directives.allows_stale() {
            return Acceptability::Unacceptable;
        }
        match request.max_stale() {
            Some(None) => Acceptability::StaleAcceptable,
            Some(Some(bound)) if self.staleness(entry, now) <= bound => {
                Acceptability::StaleAcceptable
            }
            _ => Acceptability::Unacceptable,
        }
    }
}

/// Parses an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`). A `UTC` zone name
/// is accepted as a synonym for `GMT`. The Unix epoch is rejected because it
/// doubles as the unset instant.
pub fn parse_http_timestamp(value: &str) -> Result<SystemTime, ParseError> {
    let value = value.trim();
    let normalized = match value.strip_suffix(" UTC") {
        Some(prefix) => format!("{prefix} GMT"),
        None => value.to_owned(),
    };
    match httpdate::parse_http_date(&normalized) {
        Ok(instant) if instant != UNIX_EPOCH => Ok(instant),
        _ => Err(ParseError::Timestamp(value.to_owned())),
    }
}

/// Formats an instant as an IMF-fixdate.
pub fn format_http_timestamp(instant: SystemTime) -> String {
    httpdate::fmt_http_date(instant)
}

/// `now + lifetime`, with the lifetime capped the same way parsed deltas are.
fn expires_after(now: SystemTime, lifetime: Duration) -> SystemTime {
    let lifetime = lifetime.min(Duration::from_secs(MAX_DELTA_SECONDS));
    now.checked_add(lifetime).unwrap_or(now)
}

fn header_timestamp(headers: &HeaderMap, name: HeaderName) -> Option<SystemTime> {
    let value = headers.get(&name)?;
    let parsed = value
        .to_str()
        .map_err(|_| ParseError::Timestamp(String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .and_then(parse_http_timestamp);
    match parsed {
        Ok(instant) => Some(instant),
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(header = %name, error = %_err, "substituting default timestamp");
            None
        }
    }
}
