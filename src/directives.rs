//! `Cache-Control` directive parsing.
//!
//! Header values are split on commas (respecting quoted strings), trimmed,
//! and matched as whole tokens, so an extension such as `no-cache-extended`
//! is never confused with `no-cache`. Repeated directives, whether within one
//! header value or across several occurrences of the header, are merged into
//! a single [`Directives`] map.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use http::header::{CACHE_CONTROL, PRAGMA};
use http::HeaderMap;

use crate::error::ParseError;

/// Largest delta-seconds value honored. Larger values saturate here.
pub const MAX_DELTA_SECONDS: u64 = 2_147_483_648;

/// A `Cache-Control` directive this crate understands.
///
/// Variants are ordered so that rendering puts the freshness lifetime first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Directive {
    MaxAge,
    SMaxAge,
    MaxStale,
    MinFresh,
    Public,
    Private,
    NoCache,
    NoStore,
    NoTransform,
    MustRevalidate,
    ProxyRevalidate,
    OnlyIfCached,
}

#[derive(Clone, Copy)]
enum ValueKind {
    Flag,
    Seconds,
    OptionalSeconds,
}

impl Directive {
    /// Matches a lower-cased directive name exactly.
    pub fn from_token(token: &str) -> Option<Self> {
        let directive = match token {
            "max-age" => Self::MaxAge,
            "s-maxage" => Self::SMaxAge,
            "max-stale" => Self::MaxStale,
            "min-fresh" => Self::MinFresh,
            "public" => Self::Public,
            "private" => Self::Private,
            "no-cache" => Self::NoCache,
            "no-store" => Self::NoStore,
            "no-transform" => Self::NoTransform,
            "must-revalidate" => Self::MustRevalidate,
            "proxy-revalidate" => Self::ProxyRevalidate,
            "only-if-cached" => Self::OnlyIfCached,
            _ => return None,
        };
        Some(directive)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxAge => "max-age",
            Self::SMaxAge => "s-maxage",
            Self::MaxStale => "max-stale",
            Self::MinFresh => "min-fresh",
            Self::Public => "public",
            Self::Private => "private",
            Self::NoCache => "no-cache",
            Self::NoStore => "no-store",
            Self::NoTransform => "no-transform",
            Self::MustRevalidate => "must-revalidate",
            Self::ProxyRevalidate => "proxy-revalidate",
            Self::OnlyIfCached => "only-if-cached",
        }
    }

    fn value_kind(self) -> ValueKind {
        match self {
            Self::MaxAge | Self::SMaxAge | Self::MinFresh => ValueKind::Seconds,
            Self::MaxStale => ValueKind::OptionalSeconds,
            _ => ValueKind::Flag,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized directive map parsed from one or more `Cache-Control` values.
///
/// Known directives carry an optional delta-seconds value. Unrecognized
/// tokens are kept as extensions and never influence cacheability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    known: BTreeMap<Directive, Option<u64>>,
    extensions: BTreeMap<String, Option<String>>,
}

impl Directives {
    /// Parses any number of raw `Cache-Control` header values.
    ///
    /// Malformed tokens (bad names, missing or non-numeric delta-seconds) are
    /// dropped; the remaining tokens still apply.
    pub fn parse<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut directives = Self::default();
        for value in values {
            for token in split_tokens(value) {
                if let Err(_err) = directives.merge_token(token) {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %_err, "ignoring cache directive");
                }
            }
        }
        directives
    }

    /// Parses every `Cache-Control` occurrence in `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::parse(
            headers
                .get_all(CACHE_CONTROL)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        )
    }

    /// Parses request directives, honoring `Pragma: no-cache` when the request
    /// carries no `Cache-Control` header at all.
    pub fn from_request_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::from_headers(headers);
        if !headers.contains_key(CACHE_CONTROL) && pragma_no_cache(headers) {
            directives.known.insert(Directive::NoCache, None);
        }
        directives
    }

    pub fn contains(&self, directive: Directive) -> bool {
        self.known.contains_key(&directive)
    }

    /// Returns `Some(value)` when the directive is present; `value` is `None`
    /// for directives without an argument.
    pub fn get(&self, directive: Directive) -> Option<Option<u64>> {
        self.known.get(&directive).copied()
    }

    pub fn seconds(&self, directive: Directive) -> Option<u64> {
        self.get(directive).flatten()
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.seconds(Directive::MaxAge).map(Duration::from_secs)
    }

    pub fn s_maxage(&self) -> Option<Duration> {
        self.seconds(Directive::SMaxAge).map(Duration::from_secs)
    }

    pub fn min_fresh(&self) -> Option<Duration> {
        self.seconds(Directive::MinFresh).map(Duration::from_secs)
    }

    /// `Some(None)` is a bare `max-stale`: any amount of staleness is accepted.
    pub fn max_stale(&self) -> Option<Option<Duration>> {
        self.get(Directive::MaxStale)
            .map(|bound| bound.map(Duration::from_secs))
    }

    pub fn extension(&self, name: &str) -> Option<Option<&str>> {
        self.extensions
            .get(&name.to_ascii_lowercase())
            .map(|value| value.as_deref())
    }

    pub fn extensions(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.extensions
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    /// The first directive that forbids storing a response, if any.
    pub fn storage_forbidden_by(&self) -> Option<Directive> {
        [Directive::Private, Directive::NoStore, Directive::NoCache]
            .into_iter()
            .find(|directive| self.contains(*directive))
    }

    /// Whether a response carrying these directives may be served once stale.
    pub fn allows_stale(&self) -> bool {
        !(self.contains(Directive::MustRevalidate)
            || self.contains(Directive::ProxyRevalidate)
            || self.contains(Directive::NoCache))
    }

    /// Copy with the lifetime replaced by `max-age=seconds`. Any `s-maxage`
    /// is dropped so downstream caches see a single lifetime.
    pub fn with_max_age(&self, seconds: u64) -> Self {
        let mut directives = self.clone();
        directives.known.remove(&Directive::SMaxAge);
        directives.known.insert(Directive::MaxAge, Some(seconds));
        directives
    }

    fn merge_token(&mut self, token: &str) -> Result<(), ParseError> {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name.trim(), Some(unquote(value.trim()))),
            None => (token, None),
        };
        if name.is_empty() || !name.bytes().all(is_tchar) {
            return Err(ParseError::Directive(token.to_owned()));
        }
        let name = name.to_ascii_lowercase();

        let Some(directive) = Directive::from_token(&name) else {
            self.extensions
                .entry(name)
                .or_insert_with(|| value.map(str::to_owned));
            return Ok(());
        };

        let seconds = match (directive.value_kind(), value) {
            (ValueKind::Flag, _) => None,
            (ValueKind::Seconds | ValueKind::OptionalSeconds, Some(value)) => Some(
                parse_delta_seconds(value)
                    .ok_or_else(|| ParseError::Directive(token.to_owned()))?,
            ),
            (ValueKind::Seconds, None) => return Err(ParseError::Directive(token.to_owned())),
            (ValueKind::OptionalSeconds, None) => None,
        };
        self.insert_known(directive, seconds);
        Ok(())
    }

    fn insert_known(&mut self, directive: Directive, seconds: Option<u64>) {
        match self.known.entry(directive) {
            Entry::Vacant(slot) => {
                slot.insert(seconds);
            }
            Entry::Occupied(mut slot) => {
                // Conflicting lifetimes resolve to the shortest one.
                let merged = match (*slot.get(), seconds) {
                    (Some(current), Some(next)) => Some(current.min(next)),
                    (None, Some(next)) => Some(next),
                    (current, None) => current,
                };
                slot.insert(merged);
            }
        }
    }
}

impl fmt::Display for Directives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = self.known.iter().map(|(directive, seconds)| match seconds {
            Some(seconds) => format!("{directive}={seconds}"),
            None => directive.to_string(),
        });
        let extensions = self.extensions.iter().map(|(name, value)| match value {
            Some(value) if value.is_empty() || !value.bytes().all(is_tchar) => {
                format!("{name}=\"{value}\"")
            }
            Some(value) => format!("{name}={value}"),
            None => name.clone(),
        });
        let rendered: Vec<String> = known.chain(extensions).collect();
        f.write_str(&rendered.join(", "))
    }
}

fn split_tokens(value: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                tokens.push(&value[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    tokens.push(&value[start..]);
    tokens
        .into_iter()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect()
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn parse_delta_seconds(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(
        value
            .parse::<u64>()
            .map_or(MAX_DELTA_SECONDS, |secs| secs.min(MAX_DELTA_SECONDS)),
    )
}

fn is_tchar(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

fn pragma_no_cache(headers: &HeaderMap) -> bool {
    headers
        .get_all(PRAGMA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("no-cache"))
}
